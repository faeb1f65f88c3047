use briny_rnn::cells::CellState;
use briny_rnn::loss::Loss;
use briny_rnn::model::RnnModel;
use briny_rnn::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

const VOCAB: usize = 5;

fn cyclic_ids(len: usize) -> Vec<usize> {
    (0..len).map(|i| i % VOCAB).collect()
}

fn language_model(dir: &TempDir, seed: u64) -> Rnn {
    let mut rnn = Rnn::new("lm")
        .with_logdir(dir.path())
        .with_seed(seed)
        .with_save_model_secs(None);
    rnn.set_input(&[], DType::Int32, Some(VOCAB), Some(6)).unwrap();
    rnn.set_output(&[VOCAB], DType::Float32).unwrap();
    rnn.set_target(&[], DType::Int32).unwrap();
    rnn.set_loss_func(Box::new(SequenceLoss)).unwrap();
    rnn.add_cell(CellSpec::basic_lstm(8)).unwrap();
    rnn
}

fn regression_model(dir: &TempDir, cells: &[CellSpec]) -> Rnn {
    let mut rnn = Rnn::new("reg")
        .with_logdir(dir.path())
        .with_seed(11)
        .with_initializer(Initializer::uniform(0.5))
        .with_save_model_secs(None);
    rnn.set_input(&[2], DType::Float32, None, None).unwrap();
    rnn.set_output(&[2], DType::Float32).unwrap();
    rnn.set_target(&[2], DType::Float32).unwrap();
    rnn.set_loss_func(Box::new(MeanSquaredLoss)).unwrap();
    for cell in cells {
        rnn.add_cell(cell.clone()).unwrap();
    }
    rnn
}

fn random_tensor(shape: &[usize], rng: &mut StdRng) -> Ten64 {
    let n = shape.iter().product();
    Tensor::new(shape.to_vec(), (0..n).map(|_| rng.random::<f64>() * 2.0 - 1.0).collect())
}

fn random_state(rnn: &Rnn, batch: usize, rng: &mut StdRng) -> Vec<CellState> {
    rnn.network()
        .unwrap()
        .zero_state(batch)
        .iter()
        .map(|s| match s {
            CellState::Hidden(h) => CellState::Hidden(random_tensor(&h.shape, rng)),
            CellState::Lstm { c, h } => CellState::Lstm {
                c: random_tensor(&c.shape, rng),
                h: random_tensor(&h.shape, rng),
            },
        })
        .collect()
}

/// Compares window gradients of every parameter against central differences.
///
/// Every pass runs on a fresh clone of `model`, so dropout masks drawn from its
/// generator are the same in each pass.
fn check_window_gradients(rnn: &mut Rnn, model: &RnnModel, loss: &dyn Loss, x: &Ten64, y: &Ten64) {
    const EPS: f64 = 1e-6;
    let result = model
        .clone()
        .loss_and_gradients(rnn.network().unwrap(), loss, x, y)
        .unwrap();
    let grads = result.gradients.unwrap();
    let names: Vec<String> = rnn
        .network()
        .unwrap()
        .named_params()
        .into_iter()
        .map(|(n, _)| n)
        .collect();
    assert_eq!(grads.len(), names.len());

    for (p, name) in names.iter().enumerate() {
        for i in 0..grads.tensors[p].len() {
            let mut loss_at = |delta: f64| {
                let net = rnn.network_mut().unwrap();
                net.params_mut()[p].value.data[i] += delta;
                let value = model.clone().evaluate_window(net, loss, x, y).unwrap().loss;
                net.params_mut()[p].value.data[i] -= delta;
                value
            };
            let numeric = (loss_at(EPS) - loss_at(-EPS)) / (2.0 * EPS);
            let analytic = grads.tensors[p].data[i];
            let tol = 1e-7 + 1e-4 * analytic.abs().max(numeric.abs());
            assert!(
                (analytic - numeric).abs() <= tol,
                "{name}[{i}]: analytic {analytic} vs numeric {numeric}"
            );
        }
    }
}

#[test]
fn declarations_are_frozen_after_compile() {
    let dir = TempDir::new().unwrap();
    let mut rnn = language_model(&dir, 1);
    rnn.compile(false).unwrap();
    assert!(rnn.is_compiled());

    assert!(matches!(rnn.add_cell(CellSpec::gru(4)), Err(RnnError::AlreadyCompiled)));
    assert!(matches!(
        rnn.set_output(&[3], DType::Float32),
        Err(RnnError::AlreadyCompiled)
    ));
    // second compile is a no-op
    rnn.compile(true).unwrap();
    assert!(rnn.evaluator().is_none());
}

#[test]
fn compile_reports_the_first_missing_declaration() {
    let mut rnn = Rnn::new("empty").with_save_model_secs(None);
    match rnn.compile(false) {
        Err(RnnError::MissingDeclaration(msg)) => assert!(msg.contains("input")),
        other => panic!("unexpected {other:?}"),
    }

    rnn.set_input(&[1], DType::Float32, None, None).unwrap();
    rnn.set_output(&[1], DType::Float32).unwrap();
    rnn.set_target(&[1], DType::Float32).unwrap();
    match rnn.compile(false) {
        Err(RnnError::MissingDeclaration(msg)) => assert!(msg.contains("loss")),
        other => panic!("unexpected {other:?}"),
    }

    rnn.set_loss_func(Box::new(MeanSquaredLoss)).unwrap();
    match rnn.compile(false) {
        Err(RnnError::MissingDeclaration(msg)) => assert!(msg.contains("cell")),
        other => panic!("unexpected {other:?}"),
    }
    assert!(!rnn.is_compiled());
}

#[test]
fn loss_must_accept_the_target_dtype() {
    let mut rnn = Rnn::new("mismatch").with_save_model_secs(None);
    rnn.set_input(&[1], DType::Float32, None, None).unwrap();
    rnn.set_output(&[3], DType::Float32).unwrap();
    rnn.set_target(&[3], DType::Float32).unwrap();
    rnn.set_loss_func(Box::new(SequenceLoss)).unwrap();
    rnn.add_cell(CellSpec::basic_rnn(3)).unwrap();
    assert!(matches!(rnn.compile(false), Err(RnnError::InvalidConfig(_))));
}

#[test]
fn int_inputs_need_an_embedding() {
    let mut rnn = Rnn::new("ids").with_save_model_secs(None);
    rnn.set_input(&[], DType::Int32, None, None).unwrap();
    rnn.set_output(&[4], DType::Float32).unwrap();
    rnn.set_target(&[], DType::Int32).unwrap();
    rnn.set_loss_func(Box::new(SequenceLoss)).unwrap();
    rnn.add_cell(CellSpec::basic_rnn(3)).unwrap();
    assert!(rnn.compile(false).is_err());
}

#[test]
fn projection_and_embedding_follow_the_declarations() {
    let dir = TempDir::new().unwrap();
    let mut rnn = language_model(&dir, 1);
    rnn.compile(false).unwrap();
    let net = rnn.network().unwrap();
    assert!(net.has_embedding());
    assert!(net.has_projection());
    let names: Vec<String> = net.named_params().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names.first().map(String::as_str), Some("lm/embedding/embedding"));
    assert!(names.iter().any(|n| n.starts_with("lm/multi_rnn_cell/cell_0/")));
    assert_eq!(names.last().map(String::as_str), Some("lm/project/project_b"));

    let dir = TempDir::new().unwrap();
    let mut rnn = regression_model(&dir, &[CellSpec::gru(2)]);
    rnn.compile(false).unwrap();
    assert!(!rnn.network().unwrap().has_projection());
    assert!(!rnn.network().unwrap().has_embedding());
}

#[test]
fn unrolling_follows_the_lifecycle() {
    let dir = TempDir::new().unwrap();
    let mut rnn = language_model(&dir, 2);
    assert!(matches!(rnn.unroll(1, 1, None, "Sampler"), Err(RnnError::NotCompiled)));
    assert!(matches!(
        rnn.add_trainer(TrainerConfig::new(2, 3)),
        Err(RnnError::NotCompiled)
    ));

    rnn.compile(true).unwrap();
    assert!(rnn.evaluator().is_some());
    assert!(matches!(
        rnn.add_evaluator(EvaluatorConfig::default()),
        Err(RnnError::EvaluatorExists)
    ));

    let a = rnn.unroll(1, 2, None, "Sampler").unwrap();
    let b = rnn.unroll(1, 2, None, "Sampler").unwrap();
    assert_eq!(a.name(), "Sampler");
    assert_eq!(b.name(), "Sampler_1");

    rnn.add_trainer(TrainerConfig::new(2, 3)).unwrap();
    rnn.add_trainer(TrainerConfig::new(4, 4)).unwrap();
    assert_eq!(rnn.trainer().unwrap().config().batch_size, 2);

    assert!(rnn.finalize());
    assert!(!rnn.finalize());
    assert!(matches!(rnn.unroll(1, 1, None, "Late"), Err(RnnError::Finalized)));
    assert!(matches!(rnn.add_validator(1, 1), Err(RnnError::Finalized)));
}

#[test]
fn trainer_rejects_a_zero_accumulator() {
    let dir = TempDir::new().unwrap();
    let mut rnn = language_model(&dir, 1);
    rnn.compile(false).unwrap();
    let config = TrainerConfig::new(2, 3).optimizer(OptimizerKind::Adagrad {
        initial_accumulator: 0.0,
    });
    assert!(matches!(rnn.add_trainer(config), Err(RnnError::InvalidConfig(_))));
    assert!(rnn.trainer().is_none());
}

#[test]
fn running_requires_the_matching_model() {
    let dir = TempDir::new().unwrap();
    let mut rnn = language_model(&dir, 3);
    rnn.compile(false).unwrap();
    let mut feeder = SequenceProducer::new(&cyclic_ids(100), 2, 3).unwrap();

    assert!(matches!(
        rnn.train(&mut feeder, 1, 1, None, false),
        Err(RnnError::NoTrainer)
    ));
    assert!(matches!(rnn.evaluate(&mut feeder, 1, None), Err(RnnError::NoEvaluator)));

    rnn.add_trainer(TrainerConfig::new(2, 3)).unwrap();
    let mut valid = SequenceProducer::new(&cyclic_ids(100), 2, 3).unwrap();
    let validation = Validation {
        feeder: &mut valid,
        epoch_size: 1,
    };
    assert!(matches!(
        rnn.train(&mut feeder, 1, 1, Some(validation), false),
        Err(RnnError::NoValidator)
    ));
}

#[test]
fn window_gradients_match_finite_differences() {
    let dir = TempDir::new().unwrap();
    let cells = [
        CellSpec::basic_rnn(3),
        CellSpec::Lstm {
            num_units: 3,
            forget_bias: 1.0,
            use_peepholes: true,
            cell_clip: None,
            num_proj: Some(2),
        },
        CellSpec::gru(3),
    ];
    let mut rnn = regression_model(&dir, &cells);
    rnn.compile(false).unwrap();
    assert!(rnn.network().unwrap().has_projection());

    let mut rng = StdRng::seed_from_u64(21);
    let mut model = rnn.unroll(2, 3, None, "Check").unwrap();
    let state = random_state(&rnn, 2, &mut rng);
    model.feed_state(rnn.network().unwrap(), state).unwrap();
    let x = random_tensor(&[3, 2, 2], &mut rng);
    let y = random_tensor(&[3, 2, 2], &mut rng);
    check_window_gradients(&mut rnn, &model, &MeanSquaredLoss, &x, &y);
}

#[test]
fn window_gradients_through_dropout_match_finite_differences() {
    let dir = TempDir::new().unwrap();
    let mut rnn = regression_model(&dir, &[CellSpec::gru(3), CellSpec::basic_lstm(3)]);
    rnn.compile(false).unwrap();

    let mut rng = StdRng::seed_from_u64(23);
    let mut model = rnn.unroll(2, 3, Some(0.7), "Dropout").unwrap();
    let mut plain = rnn.unroll(2, 3, None, "Plain").unwrap();
    let state = random_state(&rnn, 2, &mut rng);
    model.feed_state(rnn.network().unwrap(), state.clone()).unwrap();
    plain.feed_state(rnn.network().unwrap(), state).unwrap();
    let x = random_tensor(&[3, 2, 2], &mut rng);
    let y = random_tensor(&[3, 2, 2], &mut rng);

    let net = rnn.network().unwrap();
    let masked = model.clone().evaluate_window(net, &MeanSquaredLoss, &x, &y).unwrap();
    let replayed = model.clone().evaluate_window(net, &MeanSquaredLoss, &x, &y).unwrap();
    let unmasked = plain.evaluate_window(net, &MeanSquaredLoss, &x, &y).unwrap();
    assert_eq!(masked.outputs, replayed.outputs);
    assert_ne!(masked.outputs, unmasked.outputs);

    check_window_gradients(&mut rnn, &model, &MeanSquaredLoss, &x, &y);
}

#[test]
fn embedding_gradients_match_finite_differences() {
    let dir = TempDir::new().unwrap();
    let mut rnn = language_model(&dir, 4);
    rnn.compile(false).unwrap();

    let mut rng = StdRng::seed_from_u64(22);
    let mut model = rnn.unroll(2, 3, None, "Check").unwrap();
    let state = random_state(&rnn, 2, &mut rng);
    model.feed_state(rnn.network().unwrap(), state).unwrap();
    let x = Tensor::new(vec![3, 2], vec![0.0, 1.0, 1.0, 4.0, 0.0, 2.0]);
    let y = Tensor::new(vec![3, 2], vec![1.0, 2.0, 3.0, 0.0, 4.0, 4.0]);
    check_window_gradients(&mut rnn, &model, &SequenceLoss, &x, &y);
}

#[test]
fn state_is_threaded_between_windows() {
    let dir = TempDir::new().unwrap();
    let mut rnn = language_model(&dir, 5);
    rnn.compile(false).unwrap();
    let mut model = rnn.unroll(1, 2, None, "Sampler").unwrap();
    assert!(model.current_state().is_none());

    let x = Tensor::new(vec![2, 1], vec![1.0, 2.0]);
    let y = Tensor::new(vec![2, 1], vec![2.0, 3.0]);
    let net = rnn.network().unwrap();
    let cold = model.evaluate_window(net, &SequenceLoss, &x, &y).unwrap();
    assert!(model.current_state().is_none());

    model.feed_state(net, cold.final_state.clone()).unwrap();
    let warm = model.evaluate_window(net, &SequenceLoss, &x, &y).unwrap();
    assert_ne!(cold.outputs, warm.outputs);

    let mut feeder = WindowFeeder::new(vec![(x.clone(), y.clone())]).unwrap();
    model.reset_state();
    let stats = rnn.run(&mut model, &mut feeder, 2, None).unwrap();
    assert_eq!(stats.windows, 2);
    assert_eq!(model.current_state(), Some(&warm.final_state));
}

#[test]
fn fed_state_must_match_the_stack() {
    let dir = TempDir::new().unwrap();
    let mut rnn = language_model(&dir, 6);
    rnn.compile(false).unwrap();
    let mut model = rnn.unroll(2, 2, None, "Sampler").unwrap();
    let net = rnn.network().unwrap();
    let wrong_batch = net.zero_state(3);
    assert!(model.feed_state(net, wrong_batch).is_err());
    let wrong_kind = vec![CellState::Hidden(Ten64::zeros([2, 8]))];
    assert!(model.feed_state(net, wrong_kind).is_err());
}

#[test]
fn fed_data_is_validated() {
    let dir = TempDir::new().unwrap();
    let mut rnn = language_model(&dir, 7);
    rnn.compile(false).unwrap();
    let mut model = rnn.unroll(1, 2, None, "Sampler").unwrap();
    let net = rnn.network().unwrap();

    let wrong_shape = Ten64::zeros([3, 1]);
    let targets = Ten64::zeros([2, 1]);
    assert!(matches!(
        model.evaluate_window(net, &SequenceLoss, &wrong_shape, &targets),
        Err(RnnError::ShapeMismatch { .. })
    ));

    let out_of_vocab = Tensor::new(vec![2, 1], vec![0.0, VOCAB as f64]);
    assert!(model.check_inputs(net, &out_of_vocab).is_err());
    assert!(model.check_targets(net, &out_of_vocab).is_err());
}

#[test]
fn training_reduces_the_loss() {
    let dir = TempDir::new().unwrap();
    let mut rnn = language_model(&dir, 8);
    rnn.compile(false).unwrap();
    rnn.add_validator(2, 5).unwrap();
    rnn.add_trainer(
        TrainerConfig::new(2, 5)
            .optimizer("adam".parse().unwrap())
            .learning_rate(0.02)
            .clipper(Clipper::GlobalNorm(5.0)),
    )
    .unwrap();

    let ids = cyclic_ids(400);
    let mut train = SequenceProducer::new(&ids, 2, 5).unwrap();
    let mut valid = SequenceProducer::new(&ids, 2, 5).unwrap();
    let epoch_size = train.epoch_size();
    let validation = Validation {
        epoch_size: valid.epoch_size(),
        feeder: &mut valid,
    };
    let history = rnn.train(&mut train, epoch_size, 4, Some(validation), false).unwrap();

    assert_eq!(history.len(), 4);
    assert_eq!(rnn.global_step(), 4 * epoch_size as u64);
    let first = history[0].train.loss;
    let last = history[3].train.loss;
    assert!(last < first, "loss went from {first} to {last}");
    assert!(history.iter().all(|e| e.validation_loss.is_some()));
    assert!(history[3].validation_loss.unwrap() < (VOCAB as f64).ln());
}

#[test]
fn learning_rate_decays_per_epoch() {
    let dir = TempDir::new().unwrap();
    let mut rnn = language_model(&dir, 9);
    rnn.compile(false).unwrap();
    rnn.add_trainer(TrainerConfig::new(2, 5).learning_rate(1.0).lr_decay(0.5, 1))
        .unwrap();
    let mut train = SequenceProducer::new(&cyclic_ids(100), 2, 5).unwrap();
    let history = rnn.train(&mut train, 2, 3, None, false).unwrap();
    let rates: Vec<f64> = history.iter().map(|e| e.learning_rate).collect();
    assert_eq!(rates, vec![1.0, 0.5, 0.25]);
}

#[test]
fn dropout_only_changes_training_models() {
    let dir = TempDir::new().unwrap();
    let mut rnn = language_model(&dir, 10);
    rnn.compile(false).unwrap();
    let mut dropped = rnn.unroll(1, 2, Some(0.5), "Dropout").unwrap();
    let mut plain = rnn.unroll(1, 2, None, "Plain").unwrap();
    let net = rnn.network().unwrap();
    let x = Tensor::new(vec![2, 1], vec![1.0, 2.0]);
    let y = Tensor::new(vec![2, 1], vec![2.0, 3.0]);

    let a = plain.evaluate_window(net, &SequenceLoss, &x, &y).unwrap();
    let b = plain.evaluate_window(net, &SequenceLoss, &x, &y).unwrap();
    assert_eq!(a.outputs, b.outputs);

    let outputs: Vec<Ten64> = (0..4)
        .map(|_| dropped.evaluate_window(net, &SequenceLoss, &x, &y).unwrap().outputs)
        .collect();
    assert!(outputs.iter().any(|o| *o != outputs[0]));
    assert!(rnn.unroll(1, 1, Some(0.0), "Bad").is_err());
}

#[test]
fn evaluation_writes_records() {
    let dir = TempDir::new().unwrap();
    let mut rnn = language_model(&dir, 12);
    rnn.compile(true).unwrap();

    let out = dir.path().join("eval");
    let mut feeder = SequenceProducer::new(&cyclic_ids(50), 1, 1).unwrap();
    let eval = rnn.evaluate(&mut feeder, 6, Some(&out)).unwrap();
    assert_eq!(eval.records.len(), 6);
    assert!((eval.perplexity - eval.loss.exp()).abs() < 1e-12);

    let text = std::fs::read_to_string(out.join("records.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    let records = json.as_array().unwrap();
    assert_eq!(records.len(), 6);
    assert!(records[0].get("state").is_some());
    assert!(records[0].get("inputs").is_some());
    assert!(records[0].get("outputs").is_some());
}

#[test]
fn evaluator_records_every_nth_window() {
    let dir = TempDir::new().unwrap();
    let mut rnn = language_model(&dir, 13);
    rnn.compile(false).unwrap();
    rnn.add_evaluator(EvaluatorConfig {
        record_every: 3,
        log_state: false,
        ..EvaluatorConfig::default()
    })
    .unwrap();

    let mut feeder = SequenceProducer::new(&cyclic_ids(50), 1, 1).unwrap();
    let eval = rnn.evaluate(&mut feeder, 7, None).unwrap();
    let windows: Vec<usize> = eval.records.iter().map(|r| r.window).collect();
    assert_eq!(windows, vec![0, 3, 6]);
    assert!(eval.records.iter().all(|r| r.state.is_none()));
    assert!(dir.path().join("evaluate").join("records.json").is_file());
}

#[test]
fn builds_from_a_json_config() {
    let dir = TempDir::new().unwrap();
    let json = format!(
        r#"{{
            "name": "tiny_lm",
            "logdir": {logdir},
            "seed": 3,
            "save_model_secs": null,
            "input": {{ "dtype": "int32", "vocab_size": 5, "embedding_size": 4 }},
            "output": {{ "shape": [5], "dtype": "float32" }},
            "target": {{ "dtype": "int32" }},
            "loss": "sequence_loss",
            "cells": [
                {{ "type": "basic_lstm", "num_units": 6 }},
                {{ "type": "gru", "num_units": 5 }}
            ],
            "trainer": {{ "batch_size": 2, "num_steps": 4, "optimizer": {{ "type": "momentum" }} }},
            "validator": {{ "batch_size": 1, "num_steps": 4 }}
        }}"#,
        logdir = serde_json::to_string(&dir.path()).unwrap()
    );
    let config = RnnConfig::from_json_str(&json).unwrap();
    let mut rnn = Rnn::from_config(&config).unwrap();

    assert!(rnn.is_compiled());
    assert_eq!(rnn.models(), ["Evaluator", "Trainer", "Validator"]);
    assert!(!rnn.network().unwrap().has_projection());
    assert_eq!(rnn.network().unwrap().cells().len(), 2);

    let mut feeder = SequenceProducer::new(&cyclic_ids(60), 2, 4).unwrap();
    let history = rnn.train(&mut feeder, 2, 1, None, false).unwrap();
    assert!(history[0].train.loss.is_finite());
}

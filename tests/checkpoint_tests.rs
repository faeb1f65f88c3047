use briny_rnn::modelio::{
    CHECKPOINT_INDEX, Checkpoint, latest_checkpoint, load_checkpoint, save_checkpoint,
};
use briny_rnn::prelude::*;
use std::fs;
use tempfile::TempDir;

fn lm(logdir: &std::path::Path, seed: u64, units: usize) -> Rnn {
    lm_saving_every(logdir, seed, units, None)
}

fn lm_saving_every(
    logdir: &std::path::Path,
    seed: u64,
    units: usize,
    save_model_secs: Option<u64>,
) -> Rnn {
    let mut rnn = Rnn::new("ckpt")
        .with_logdir(logdir)
        .with_seed(seed)
        .with_save_model_secs(save_model_secs);
    rnn.set_input(&[], DType::Int32, Some(4), Some(3)).unwrap();
    rnn.set_output(&[4], DType::Float32).unwrap();
    rnn.set_target(&[], DType::Int32).unwrap();
    rnn.set_loss_func(Box::new(SequenceLoss)).unwrap();
    rnn.add_cell(CellSpec::basic_lstm(units)).unwrap();
    rnn.compile(true).unwrap();
    rnn
}

fn values(rnn: &Rnn) -> Vec<(String, Ten64)> {
    rnn.network()
        .unwrap()
        .named_params()
        .into_iter()
        .map(|(n, w)| (n, w.value.clone()))
        .collect()
}

fn train_epochs(rnn: &mut Rnn, epochs: usize) {
    rnn.add_trainer(TrainerConfig::new(2, 3)).unwrap();
    let ids: Vec<usize> = (0..80).map(|i| (i * 3) % 4).collect();
    let mut feeder = SequenceProducer::new(&ids, 2, 3).unwrap();
    rnn.train(&mut feeder, 4, epochs, None, false).unwrap();
}

fn trained(logdir: &std::path::Path) -> Rnn {
    let mut rnn = lm(logdir, 1, 5);
    train_epochs(&mut rnn, 1);
    rnn
}

fn checkpoint_files(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".bpat"))
        .collect();
    names.sort();
    names
}

#[test]
fn checkpoint_file_round_trips() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("model-7.bpat");
    let checkpoint = Checkpoint {
        global_step: 7,
        tensors: vec![
            ("a".into(), Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])),
            ("b/c".into(), Tensor::new(vec![4], vec![7.0, 8.0, 9.0, 10.0])),
        ],
    };
    save_checkpoint(&path, &checkpoint).unwrap();
    assert_eq!(load_checkpoint(&path).unwrap(), checkpoint);
}

#[test]
fn save_names_the_file_after_the_step() {
    let dir = TempDir::new().unwrap();
    let mut rnn = trained(dir.path());
    assert_eq!(rnn.global_step(), 4);

    let path = rnn.save(None).unwrap();
    assert_eq!(path, dir.path().join("model-4.bpat"));
    assert_eq!(latest_checkpoint(dir.path()).unwrap(), Some(path));
    let index = fs::read_to_string(dir.path().join(CHECKPOINT_INDEX)).unwrap();
    assert!(index.contains("model-4.bpat"));
}

#[test]
fn restore_loads_parameters_and_step() {
    let dir = TempDir::new().unwrap();
    let mut source = trained(dir.path());
    source.save(None).unwrap();

    let other = TempDir::new().unwrap();
    let mut target = lm(other.path(), 2, 5);
    assert_ne!(values(&source), values(&target));

    target.restore(Some(dir.path())).unwrap();
    assert_eq!(values(&source), values(&target));
    assert_eq!(target.global_step(), 4);
}

#[test]
fn session_restores_from_the_log_directory() {
    let dir = TempDir::new().unwrap();
    let mut source = trained(dir.path());
    source.save(None).unwrap();

    let mut resumed = lm(dir.path(), 3, 5);
    assert_eq!(resumed.global_step(), 0);
    let ids: Vec<usize> = (0..20).map(|i| i % 4).collect();
    let mut feeder = SequenceProducer::new(&ids, 1, 1).unwrap();
    let eval_dir = TempDir::new().unwrap();
    resumed.evaluate(&mut feeder, 2, Some(eval_dir.path())).unwrap();

    assert_eq!(resumed.global_step(), 4);
    assert_eq!(values(&source), values(&resumed));
}

#[test]
fn restore_without_checkpoint_fails() {
    let dir = TempDir::new().unwrap();
    let mut rnn = lm(dir.path(), 1, 5);
    assert!(matches!(
        rnn.restore(Some(dir.path())),
        Err(RnnError::NoCheckpoint(_))
    ));
}

#[test]
fn restore_rejects_corrupted_files() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("model-3.bpat"), b"nope, not a checkpoint").unwrap();
    let mut rnn = lm(dir.path(), 1, 5);
    let before = values(&rnn);
    assert!(rnn.restore(Some(dir.path())).is_err());
    assert_eq!(values(&rnn), before);
}

#[test]
fn restore_rejects_a_different_architecture() {
    let dir = TempDir::new().unwrap();
    let mut source = trained(dir.path());
    source.save(None).unwrap();

    let other = TempDir::new().unwrap();
    let mut wider = lm(other.path(), 1, 7);
    let before = values(&wider);
    assert!(matches!(
        wider.restore(Some(dir.path())),
        Err(RnnError::Checkpoint(_))
    ));
    assert_eq!(values(&wider), before);
    assert_eq!(wider.global_step(), 0);
}

#[test]
fn latest_checkpoint_prefers_the_index() {
    let dir = TempDir::new().unwrap();
    let ckpt = Checkpoint {
        global_step: 1,
        tensors: vec![("w".into(), Tensor::new(vec![1], vec![0.5]))],
    };
    save_checkpoint(&dir.path().join("model-10.bpat"), &ckpt).unwrap();
    save_checkpoint(&dir.path().join("model-2.bpat"), &ckpt).unwrap();
    assert_eq!(
        latest_checkpoint(dir.path()).unwrap(),
        Some(dir.path().join("model-10.bpat"))
    );

    fs::write(
        dir.path().join(CHECKPOINT_INDEX),
        "model_checkpoint_path: \"model-2.bpat\"\n",
    )
    .unwrap();
    assert_eq!(
        latest_checkpoint(dir.path()).unwrap(),
        Some(dir.path().join("model-2.bpat"))
    );
    assert_eq!(latest_checkpoint(&dir.path().join("missing")).unwrap(), None);
}

#[test]
fn training_autosaves_once_the_interval_elapses() {
    let dir = TempDir::new().unwrap();
    let mut rnn = lm_saving_every(dir.path(), 1, 5, Some(0));
    train_epochs(&mut rnn, 2);
    assert_eq!(rnn.global_step(), 8);

    assert_eq!(checkpoint_files(dir.path()), vec!["model-4.bpat", "model-8.bpat"]);
    let index = fs::read_to_string(dir.path().join(CHECKPOINT_INDEX)).unwrap();
    assert!(index.contains("model-8.bpat"));
    assert_eq!(
        latest_checkpoint(dir.path()).unwrap(),
        Some(dir.path().join("model-8.bpat"))
    );
}

#[test]
fn training_without_a_save_interval_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let mut rnn = lm(dir.path(), 1, 5);
    train_epochs(&mut rnn, 2);
    assert_eq!(rnn.global_step(), 8);
    assert!(checkpoint_files(dir.path()).is_empty());
    assert!(!dir.path().join(CHECKPOINT_INDEX).exists());
}

#[test]
fn a_long_save_interval_defers_the_autosave() {
    let dir = TempDir::new().unwrap();
    let mut rnn = lm_saving_every(dir.path(), 1, 5, Some(3600));
    train_epochs(&mut rnn, 1);
    assert!(checkpoint_files(dir.path()).is_empty());
}

use briny_rnn::prelude::*;
use std::collections::BTreeSet;

const TEXT: &str = "the quick brown fox jumps over the lazy dog. \
                    a stitch in time saves nine. \
                    all that glitters is not gold. \
                    the early bird catches the worm. ";

fn main() -> briny_rnn::error::Result<()> {
    env_logger::init();

    // character vocabulary
    let vocab: Vec<char> = TEXT.chars().collect::<BTreeSet<_>>().into_iter().collect();
    let ids: Vec<usize> = TEXT
        .repeat(8)
        .chars()
        .filter_map(|c| vocab.iter().position(|&v| v == c))
        .collect();
    let split = ids.len() * 9 / 10;

    let logdir = std::env::temp_dir().join("briny_rnn_char_lm");
    let mut rnn = Rnn::new("char_lm")
        .with_logdir(&logdir)
        .with_seed(42)
        .with_save_model_secs(Some(60));
    rnn.set_input(&[], DType::Int32, Some(vocab.len()), Some(16))?;
    rnn.set_output(&[vocab.len()], DType::Float32)?;
    rnn.set_target(&[], DType::Int32)?;
    rnn.set_loss_func(Box::new(SequenceLoss))?;
    rnn.add_cell(CellSpec::basic_lstm(32))?;
    rnn.compile(true)?;

    rnn.add_trainer(
        TrainerConfig::new(4, 10)
            .optimizer("adam".parse()?)
            .learning_rate(0.01)
            .clipper(Clipper::GlobalNorm(5.0))
            .lr_decay(0.8, 3),
    )?;
    rnn.add_validator(2, 10)?;

    let mut train = SequenceProducer::new(&ids[..split], 4, 10)?;
    let mut valid = SequenceProducer::new(&ids[split..], 2, 10)?;
    let epoch_size = train.epoch_size();
    let validation = Validation {
        epoch_size: valid.epoch_size(),
        feeder: &mut valid,
    };
    for summary in rnn.train(&mut train, epoch_size, 6, Some(validation), true)? {
        println!(
            "epoch {}: lr {:.4}, train perplexity {:.3}, valid perplexity {:.3}",
            summary.epoch + 1,
            summary.learning_rate,
            summary.train.perplexity(),
            summary.validation_loss.map_or(f64::NAN, f64::exp)
        );
    }

    let mut test = SequenceProducer::new(&ids[split..], 1, 1)?;
    let steps = test.epoch_size().min(50);
    let eval = rnn.evaluate(&mut test, steps, None)?;
    println!("test perplexity {:.3} over {} records", eval.perplexity, eval.records.len());

    let path = rnn.save(None)?;
    println!("saved to {}", path.display());
    Ok(())
}

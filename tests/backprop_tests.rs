use briny_rnn::backprop::*;
use briny_rnn::tensor;
use briny_rnn::tensors::{Tensor, WithGrad};

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[test]
fn test_matmul_backprop() {
    let a = WithGrad::new(tensor!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]));
    let b = WithGrad::new(tensor!([[7.0, 8.0], [9.0, 10.0], [11.0, 12.0]]));

    let (output, backward) = matmul(&a, &b);
    assert_eq!(output.shape, vec![2, 2]);
    let (grad_a, grad_b) = backward(&Tensor::new(vec![2, 2], vec![1.0; 4]));
    assert_eq!(grad_a, tensor!([[15.0, 19.0, 23.0], [15.0, 19.0, 23.0]]));
    assert_eq!(grad_b, tensor!([[5.0, 5.0], [7.0, 7.0], [9.0, 9.0]]));
}

#[test]
fn test_sigmoid_and_tanh_backprop() {
    let x = tensor!([-1000.0, 0.0, 1000.0]);
    let (s, back) = sigmoid(&x);
    assert_eq!(s.data, vec![0.0, 0.5, 1.0]);
    assert_eq!(back(&tensor!([1.0, 1.0, 1.0])).data[1], 0.25);

    let (t, back) = tanh(&tensor!([0.0, 0.5]));
    assert_eq!(t.data[0], 0.0);
    let g = back(&tensor!([1.0, 1.0]));
    assert!(close(g.data[1], 1.0 - 0.5f64.tanh().powi(2)));
}

#[test]
fn test_embedding_lookup_accumulates_repeated_ids() {
    let table = WithGrad::new(tensor!([[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]));
    let ids = vec![2, 0, 2];
    let (rows, back) = embedding_lookup(&table, &ids);
    assert_eq!(rows, tensor!([[5.0, 6.0], [1.0, 2.0], [5.0, 6.0]]));

    let mut acc = table.value.zeros_like();
    back(&tensor!([[1.0, 1.0], [0.5, 0.5], [2.0, 2.0]]), &mut acc);
    assert_eq!(acc, tensor!([[0.5, 0.5], [0.0, 0.0], [3.0, 3.0]]));
}

#[test]
fn test_mse_loss() {
    let pred = tensor!([1.0, 2.0]);
    let target = tensor!([1.5, 2.5]);
    let (loss, backward) = mse_loss(&pred, &target);
    let grad = backward(1.0);
    assert_eq!(loss, 0.25);
    assert_eq!(grad.data, vec![-0.5, -0.5]);
}

#[test]
fn test_softmax_cross_entropy() {
    let logits = tensor!([[0.0, 0.0], [1000.0, 0.0]]);
    let labels = vec![1, 0];
    let (loss, back) = softmax_cross_entropy(&logits, &labels);
    assert!(close(loss, 2f64.ln() / 2.0));

    let grad = back(1.0);
    assert!(close(grad.data[0], 0.25));
    assert!(close(grad.data[1], -0.25));
    assert!(close(grad.data[2], 0.0));
    assert!(close(grad.data[3], 0.0));
}

#[test]
fn test_sgd() {
    let mut w = WithGrad {
        value: tensor!([1.0, 2.0]),
        grad: tensor!([0.1, 0.2]),
    };
    sgd(&mut w, 0.5);
    assert_eq!(w.value.data, vec![0.95, 1.9]);
    assert_eq!(w.grad.data, vec![0.0, 0.0]);
}

#[test]
fn test_adam_first_step_moves_by_learning_rate() {
    let mut w = WithGrad {
        value: tensor!([1.0, -1.0]),
        grad: tensor!([0.3, -2.0]),
    };
    let mut m = w.value.zeros_like();
    let mut v = w.value.zeros_like();
    adam(&mut w, &mut m, &mut v, 1, 0.1, (0.9, 0.999), 1e-12);
    assert!((w.value.data[0] - 0.9).abs() < 1e-6);
    assert!((w.value.data[1] + 0.9).abs() < 1e-6);
    assert_eq!(w.grad.data, vec![0.0, 0.0]);
}

#[test]
fn test_momentum_accumulates_velocity() {
    let mut w = WithGrad::new(tensor!([0.0]));
    let mut acc = w.value.zeros_like();
    w.grad = tensor!([1.0]);
    momentum(&mut w, &mut acc, 1.0, 0.5);
    w.grad = tensor!([1.0]);
    momentum(&mut w, &mut acc, 1.0, 0.5);
    assert_eq!(acc.data, vec![1.5]);
    assert_eq!(w.value.data, vec![-2.5]);
}

#[test]
fn test_adagrad_skips_zero_gradients() {
    let mut w = WithGrad::new(tensor!([1.0, 1.0]));
    let mut acc = Tensor::filled(vec![2], 0.1);
    w.grad = tensor!([0.0, 2.0]);
    adagrad(&mut w, &mut acc, 0.5);
    assert_eq!(w.value.data[0], 1.0);
    assert!(close(acc.data[1], 4.1));
    assert!(close(w.value.data[1], 1.0 - 0.5 * 2.0 / 4.1f64.sqrt()));
    assert_eq!(w.grad.data, vec![0.0, 0.0]);
}

#[test]
fn test_rmsprop_with_zero_gradient_stays_finite() {
    let mut w = WithGrad::new(tensor!([1.0, 1.0]));
    let mut ms = w.value.zeros_like();
    w.grad = tensor!([0.0, 1.0]);
    rmsprop(&mut w, &mut ms, 0.1, 0.9, 1e-10);
    assert_eq!(w.value.data[0], 1.0);
    assert!(close(ms.data[1], 0.1));
    assert!(close(w.value.data[1], 1.0 - 0.1 / (0.1f64 + 1e-10).sqrt()));
}

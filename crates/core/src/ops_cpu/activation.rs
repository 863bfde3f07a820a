use crate::tensor::Float;

pub fn relu_forward(input: &[Float], output: &mut [Float]) {
    for (o, &x) in output.iter_mut().zip(input) {
        *o = x.max(0.0);
    }
}

/// Accumulates the incoming gradient wherever the input was non-negative.
pub fn relu_backward(grad_output: &[Float], input: &[Float], grad_input: &mut [Float]) {
    for ((gi, &g), &x) in grad_input.iter_mut().zip(grad_output).zip(input) {
        if x >= 0.0 {
            *gi += g;
        }
    }
}

pub fn sigmoid_forward(input: &[Float], output: &mut [Float]) {
    for (o, &x) in output.iter_mut().zip(input) {
        *o = 1.0 / (1.0 + (-x).exp());
    }
}

pub fn sigmoid_backward(grad_output: &[Float], output: &[Float], grad_input: &mut [Float]) {
    for ((gi, &g), &y) in grad_input.iter_mut().zip(grad_output).zip(output) {
        *gi += y * (1.0 - y) * g;
    }
}

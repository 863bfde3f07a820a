//! Parallel CPU kernels behind the layers.
//!
//! Every kernel splits its output into runs of whole rows (batch rows,
//! pictures or output channels) and gives each pool job one run, so no two
//! jobs write the same cell. Gradients are accumulated, never overwritten.

use std::sync::Arc;

use crate::ops_cpu::{add_column_bias, add_row_bias, axpy, gemm_nt};
use crate::tensor::Float;
use crate::thread_pool::ThreadPool;

/// Shape of one 2-D convolution over a batch of `[C, H, W]` pictures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    pub out_h: usize,
    pub out_w: usize,
}

impl ConvGeometry {
    pub fn input_len(&self) -> usize {
        self.in_channels * self.in_h * self.in_w
    }

    pub fn output_len(&self) -> usize {
        self.out_channels * self.positions()
    }

    /// Output positions per channel.
    pub fn positions(&self) -> usize {
        self.out_h * self.out_w
    }

    /// Values in one receptive field: `in_channels * k * k`.
    pub fn patch_len(&self) -> usize {
        self.in_channels * self.kernel * self.kernel
    }

    /// Input coordinate read by output coordinate `o` at kernel tap `k`,
    /// or `None` when it falls into the zero padding.
    #[inline]
    fn source(&self, o: usize, k: usize, extent: usize) -> Option<usize> {
        (o * self.stride + k)
            .checked_sub(self.padding)
            .filter(|&i| i < extent)
    }

    /// Calls `f(patch_index, input_index)` for every in-bounds tap of the
    /// receptive field at `(oy, ox)`, with indices local to one picture.
    #[inline]
    fn for_each_tap(&self, oy: usize, ox: usize, mut f: impl FnMut(usize, usize)) {
        let k = self.kernel;
        for ci in 0..self.in_channels {
            for ky in 0..k {
                let Some(iy) = self.source(oy, ky, self.in_h) else {
                    continue;
                };
                for kx in 0..k {
                    let Some(ix) = self.source(ox, kx, self.in_w) else {
                        continue;
                    };
                    f((ci * k + ky) * k + kx, (ci * self.in_h + iy) * self.in_w + ix);
                }
            }
        }
    }
}

/// Shape of a max-pool or upsample over `[B, C, H, W]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGeometry {
    pub batch: usize,
    pub channels: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub out_h: usize,
    pub out_w: usize,
    /// Pool window side, or upsample factor.
    pub size: usize,
}

impl WindowGeometry {
    pub fn input_len(&self) -> usize {
        self.channels * self.in_h * self.in_w
    }

    pub fn output_len(&self) -> usize {
        self.channels * self.out_h * self.out_w
    }
}

#[derive(Clone)]
pub struct CpuBackend {
    pool: Arc<ThreadPool>,
}

impl CpuBackend {
    pub fn new(pool: Arc<ThreadPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// `out[r, c] = bias[c] + Σ_k input[r, k] * weight[c, k]`
    pub fn linear_forward(
        &self,
        input: &[Float],
        weight: &[Float],
        bias: &[Float],
        out: &mut [Float],
        in_features: usize,
        out_features: usize,
    ) {
        self.pool.for_each_rows(out, out_features, |first, run| {
            let rows = run.len() / out_features;
            let x = &input[first * in_features..(first + rows) * in_features];
            gemm_nt(x, weight, run, rows, out_features, in_features);
            add_column_bias(run, bias, rows, out_features);
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn linear_backward(
        &self,
        input: &[Float],
        input_grad: &mut [Float],
        weight: &[Float],
        weight_grad: &mut [Float],
        bias_grad: &mut [Float],
        out_grad: &[Float],
        in_features: usize,
        out_features: usize,
    ) {
        let rows = out_grad.len() / out_features.max(1);

        self.pool.for_each_rows(input_grad, in_features, |first, run| {
            for (r, dx) in run.chunks_mut(in_features).enumerate() {
                let g = &out_grad[(first + r) * out_features..(first + r + 1) * out_features];
                for (c, &gc) in g.iter().enumerate() {
                    axpy(gc, &weight[c * in_features..(c + 1) * in_features], dx);
                }
            }
        });

        self.pool.for_each_rows_zip(
            weight_grad,
            in_features,
            bias_grad,
            1,
            |first, w_run, b_run| {
                for (j, (dw, db)) in w_run.chunks_mut(in_features).zip(b_run.iter_mut()).enumerate() {
                    let c = first + j;
                    for r in 0..rows {
                        let g = out_grad[r * out_features + c];
                        axpy(g, &input[r * in_features..(r + 1) * in_features], dw);
                        *db += g;
                    }
                }
            },
        );
    }

    /// Direct convolution, one job per run of pictures.
    pub fn conv_direct_forward(
        &self,
        geom: &ConvGeometry,
        input: &[Float],
        kernel: &[Float],
        bias: &[Float],
        out: &mut [Float],
    ) {
        let (in_len, out_len, patch) = (geom.input_len(), geom.output_len(), geom.patch_len());
        self.pool.for_each_rows(out, out_len, |first, run| {
            for (i, picture) in run.chunks_mut(out_len).enumerate() {
                let x = &input[(first + i) * in_len..(first + i + 1) * in_len];
                for co in 0..geom.out_channels {
                    let w = &kernel[co * patch..(co + 1) * patch];
                    for oy in 0..geom.out_h {
                        for ox in 0..geom.out_w {
                            let mut sum = bias[co];
                            geom.for_each_tap(oy, ox, |e, src| sum += x[src] * w[e]);
                            picture[(co * geom.out_h + oy) * geom.out_w + ox] = sum;
                        }
                    }
                }
            }
        });
    }

    /// Kernel and bias gradients are split by output channel; the input
    /// gradient is split by picture.
    #[allow(clippy::too_many_arguments)]
    pub fn conv_direct_backward(
        &self,
        geom: &ConvGeometry,
        input: &[Float],
        input_grad: &mut [Float],
        kernel: &[Float],
        kernel_grad: &mut [Float],
        bias_grad: &mut [Float],
        out_grad: &[Float],
    ) {
        let (in_len, out_len, patch, positions) = (
            geom.input_len(),
            geom.output_len(),
            geom.patch_len(),
            geom.positions(),
        );

        self.pool
            .for_each_rows_zip(kernel_grad, patch, bias_grad, 1, |first, k_run, b_run| {
                for (j, (dk, db)) in k_run.chunks_mut(patch).zip(b_run.iter_mut()).enumerate() {
                    let co = first + j;
                    for b in 0..geom.batch {
                        let x = &input[b * in_len..(b + 1) * in_len];
                        let g = &out_grad[b * out_len + co * positions..][..positions];
                        for oy in 0..geom.out_h {
                            for ox in 0..geom.out_w {
                                let gv = g[oy * geom.out_w + ox];
                                *db += gv;
                                geom.for_each_tap(oy, ox, |e, src| dk[e] += x[src] * gv);
                            }
                        }
                    }
                }
            });

        self.pool.for_each_rows(input_grad, in_len, |first, run| {
            for (i, dx) in run.chunks_mut(in_len).enumerate() {
                let g = &out_grad[(first + i) * out_len..(first + i + 1) * out_len];
                for co in 0..geom.out_channels {
                    let w = &kernel[co * patch..(co + 1) * patch];
                    for oy in 0..geom.out_h {
                        for ox in 0..geom.out_w {
                            let gv = g[(co * geom.out_h + oy) * geom.out_w + ox];
                            geom.for_each_tap(oy, ox, |e, src| dx[src] += w[e] * gv);
                        }
                    }
                }
            }
        });
    }

    /// Lays out receptive fields as rows of `columns`, shape
    /// `[batch * positions, patch_len]`; padded taps become zero.
    pub fn im2col(&self, geom: &ConvGeometry, input: &[Float], columns: &mut [Float]) {
        let (in_len, patch, positions) = (geom.input_len(), geom.patch_len(), geom.positions());
        self.pool
            .for_each_rows(columns, positions * patch, |first, run| {
                for (i, picture) in run.chunks_mut(positions * patch).enumerate() {
                    let x = &input[(first + i) * in_len..(first + i + 1) * in_len];
                    picture.fill(0.0);
                    for oy in 0..geom.out_h {
                        for ox in 0..geom.out_w {
                            let row = &mut picture[(oy * geom.out_w + ox) * patch..][..patch];
                            geom.for_each_tap(oy, ox, |e, src| row[e] = x[src]);
                        }
                    }
                }
            });
    }

    /// `out[b] = kernel * columns[b]^T + bias`, one job per run of pictures.
    pub fn conv_gemm_forward(
        &self,
        geom: &ConvGeometry,
        columns: &[Float],
        kernel: &[Float],
        bias: &[Float],
        out: &mut [Float],
    ) {
        let (out_len, patch, positions) = (geom.output_len(), geom.patch_len(), geom.positions());
        self.pool.for_each_rows(out, out_len, |first, run| {
            for (i, picture) in run.chunks_mut(out_len).enumerate() {
                let col = &columns[(first + i) * positions * patch..][..positions * patch];
                gemm_nt(kernel, col, picture, geom.out_channels, positions, patch);
                add_row_bias(picture, bias, geom.out_channels, positions);
            }
        });
    }

    /// Backward of the im2col path. The input gradient scatters the column
    /// gradient straight back to the image (col2im) without materializing it.
    #[allow(clippy::too_many_arguments)]
    pub fn conv_gemm_backward(
        &self,
        geom: &ConvGeometry,
        columns: &[Float],
        input_grad: &mut [Float],
        kernel: &[Float],
        kernel_grad: &mut [Float],
        bias_grad: &mut [Float],
        out_grad: &[Float],
    ) {
        let (in_len, out_len, patch, positions) = (
            geom.input_len(),
            geom.output_len(),
            geom.patch_len(),
            geom.positions(),
        );

        self.pool
            .for_each_rows_zip(kernel_grad, patch, bias_grad, 1, |first, k_run, b_run| {
                for (j, (dk, db)) in k_run.chunks_mut(patch).zip(b_run.iter_mut()).enumerate() {
                    let co = first + j;
                    for b in 0..geom.batch {
                        let g = &out_grad[b * out_len + co * positions..][..positions];
                        for (p, &gv) in g.iter().enumerate() {
                            *db += gv;
                            axpy(gv, &columns[(b * positions + p) * patch..][..patch], dk);
                        }
                    }
                }
            });

        self.pool.for_each_rows(input_grad, in_len, |first, run| {
            let mut col_grad = vec![0.0; patch];
            for (i, dx) in run.chunks_mut(in_len).enumerate() {
                let g = &out_grad[(first + i) * out_len..(first + i + 1) * out_len];
                for oy in 0..geom.out_h {
                    for ox in 0..geom.out_w {
                        let p = oy * geom.out_w + ox;
                        col_grad.fill(0.0);
                        for co in 0..geom.out_channels {
                            axpy(
                                g[co * positions + p],
                                &kernel[co * patch..(co + 1) * patch],
                                &mut col_grad,
                            );
                        }
                        geom.for_each_tap(oy, ox, |e, src| dx[src] += col_grad[e]);
                    }
                }
            }
        });
    }

    /// Non-overlapping max pooling. `argmax` receives, per output cell, the
    /// flat input offset of the first maximum in its window.
    pub fn maxpool_forward(
        &self,
        geom: &WindowGeometry,
        input: &[Float],
        out: &mut [Float],
        argmax: &mut [usize],
    ) {
        let (in_len, out_len, s) = (geom.input_len(), geom.output_len(), geom.size);
        self.pool
            .for_each_rows_zip(out, out_len, argmax, out_len, |first, o_run, a_run| {
                for (i, (value, arg)) in o_run.iter_mut().zip(a_run.iter_mut()).enumerate() {
                    let o = first * out_len + i;
                    let b = o / out_len;
                    let c = o % out_len / (geom.out_h * geom.out_w);
                    let oy = o % (geom.out_h * geom.out_w) / geom.out_w;
                    let ox = o % geom.out_w;
                    let plane = b * in_len + c * geom.in_h * geom.in_w;

                    let mut best = plane + oy * s * geom.in_w + ox * s;
                    for ky in 0..s {
                        for kx in 0..s {
                            let at = plane + (oy * s + ky) * geom.in_w + ox * s + kx;
                            if input[at] > input[best] {
                                best = at;
                            }
                        }
                    }
                    *value = input[best];
                    *arg = best;
                }
            });
    }

    pub fn maxpool_backward(
        &self,
        geom: &WindowGeometry,
        input_grad: &mut [Float],
        out_grad: &[Float],
        argmax: &[usize],
    ) {
        let (in_len, out_len) = (geom.input_len(), geom.output_len());
        self.pool.for_each_rows(input_grad, in_len, |first, run| {
            let pictures = run.len() / in_len;
            let outputs = first * out_len..(first + pictures) * out_len;
            for (&g, &at) in out_grad[outputs.clone()].iter().zip(&argmax[outputs]) {
                run[at - first * in_len] += g;
            }
        });
    }

    /// Nearest-neighbour upsampling by `geom.size`.
    pub fn upsample_forward(&self, geom: &WindowGeometry, input: &[Float], out: &mut [Float]) {
        let (in_len, out_len, f) = (geom.input_len(), geom.output_len(), geom.size);
        self.pool.for_each_rows(out, out_len, |first, run| {
            for (i, picture) in run.chunks_mut(out_len).enumerate() {
                let x = &input[(first + i) * in_len..(first + i + 1) * in_len];
                for c in 0..geom.channels {
                    for y in 0..geom.out_h {
                        let src = &x[(c * geom.in_h + y / f) * geom.in_w..][..geom.in_w];
                        let dst = &mut picture[(c * geom.out_h + y) * geom.out_w..][..geom.out_w];
                        for (xo, v) in dst.iter_mut().enumerate() {
                            *v = src[xo / f];
                        }
                    }
                }
            }
        });
    }

    pub fn upsample_backward(&self, geom: &WindowGeometry, input_grad: &mut [Float], out_grad: &[Float]) {
        let (in_len, out_len, f) = (geom.input_len(), geom.output_len(), geom.size);
        self.pool.for_each_rows(input_grad, in_len, |first, run| {
            for (i, dx) in run.chunks_mut(in_len).enumerate() {
                let g = &out_grad[(first + i) * out_len..(first + i + 1) * out_len];
                for c in 0..geom.channels {
                    for y in 0..geom.out_h {
                        let src = &g[(c * geom.out_h + y) * geom.out_w..][..geom.out_w];
                        let dst = &mut dx[(c * geom.in_h + y / f) * geom.in_w..][..geom.in_w];
                        for (xo, &gv) in src.iter().enumerate() {
                            dst[xo / f] += gv;
                        }
                    }
                }
            }
        });
    }
}

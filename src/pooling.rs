//! Max pooling and its inverse, unpooling.
//!
//! Pooling is square. Borders are never dropped: a window hanging over the
//! edge of the input pools whatever part of it is inside.

use ndarray::*;

use crate::{
    error::{Error, Result},
    layer::{Layer, LayerId, Pass},
    network::Network,
    Activations, Element, Layout, Shape4,
};

/// Output size along one spatial axis of a max pooling.
///
/// `ceil((size - pool_size + stride) / stride)`
pub fn pool_output_size(size: usize, pool_size: usize, stride: usize) -> usize {
    (size + 2 * stride - 1).saturating_sub(pool_size) / stride
}

pub(crate) fn check_window(layer: &'static str, pool_size: usize, stride: usize) -> Result<()> {
    if pool_size == 0 || stride == 0 {
        return Err(Error::config(layer, "pool size and stride must be positive"));
    }
    if stride > pool_size {
        return Err(Error::config(
            layer,
            format!(
                "stride {} larger than pool size {} would skip inputs",
                stride, pool_size
            ),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct MaxPooling {
    input_layer: LayerId,
    input_shape: Shape4,
    pool_size: usize,
    stride: usize,
    layout: Layout,
    output_shape: Shape4,
}

impl MaxPooling {
    /// Adds a max pooling of `input`. The stride defaults to the pool size.
    /// The pooling runs in whatever layout `input` produces.
    pub fn new<F: Element>(
        net: &mut Network<F>,
        input: LayerId,
        pool_size: usize,
        stride: Option<usize>,
    ) -> Result<LayerId> {
        let stride = stride.unwrap_or(pool_size);
        check_window("max pooling", pool_size, stride)?;
        let predecessor = net.layer(input)?;
        let layout = predecessor.layout();
        let input_shape = predecessor.output_shape();
        let (channels, width, height, batch) = layout.shape_to_c01b(input_shape);
        if width < pool_size || height < pool_size {
            return Err(Error::shape(
                "max pooling",
                format!(
                    "pool size {} exceeds the {}x{} input",
                    pool_size, width, height
                ),
            ));
        }
        let output_shape = layout.shape_from_c01b((
            channels,
            pool_output_size(width, pool_size, stride),
            pool_output_size(height, pool_size, stride),
            batch,
        ));
        net.insert(MaxPooling {
            input_layer: input,
            input_shape,
            pool_size,
            stride,
            layout,
            output_shape,
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }
}

impl<F: Element> Layer<F> for MaxPooling {
    fn kind(&self) -> &'static str {
        "max pooling"
    }

    fn input_layer(&self) -> Option<LayerId> {
        Some(self.input_layer)
    }

    fn mb_size(&self) -> usize {
        self.layout.shape_to_c01b(self.output_shape).3
    }

    fn output_shape(&self) -> Shape4 {
        self.output_shape
    }

    fn layout(&self) -> Layout {
        self.layout
    }

    fn output(
        &self,
        net: &Network<F>,
        pass: &mut Pass<'_, F>,
        input: Option<Activations<F>>,
    ) -> Result<Activations<F>> {
        let input = net.upstream("max pooling", self.input_layer, self.input_shape, pass, input)?;
        let pooled = max_pool(
            input.view().permuted_axes(self.layout.to_c01b_axes()),
            self.pool_size,
            self.stride,
        );
        Ok(to_layout(pooled, self.layout))
    }

    fn as_max_pooling(&self) -> Option<&MaxPooling> {
        Some(self)
    }
}

/// Inverse of a [`MaxPooling`]: routes every value of its input back to the
/// position(s) that held the maximum of the corresponding pooling window, and
/// zero everywhere else.
#[derive(Debug, Clone)]
pub struct Unpooling {
    input_layer: LayerId,
    input_shape: Shape4,
    pooling: LayerId,
    pooled_input: LayerId,
    pool_size: usize,
    stride: usize,
    layout: Layout,
    output_shape: Shape4,
}

impl Unpooling {
    /// Adds an unpooling of `input` inverting the max pooling `pooling`.
    /// `input` must produce activations of the pooling's output shape.
    pub fn new<F: Element>(
        net: &mut Network<F>,
        input: LayerId,
        pooling: LayerId,
    ) -> Result<LayerId> {
        let pool = net.max_pooling(pooling)?.clone();
        let predecessor = net.layer(input)?;
        if predecessor.layout() != pool.layout {
            return Err(Error::shape(
                "unpooling",
                format!(
                    "input layer {} produces {:?} activations, pooling {} works in {:?}",
                    input,
                    predecessor.layout(),
                    pooling,
                    pool.layout
                ),
            ));
        }
        let input_shape = predecessor.output_shape();
        let pool_output = Layer::<F>::output_shape(&pool);
        if input_shape != pool_output {
            return Err(Error::shape(
                "unpooling",
                format!(
                    "input shape {:?} does not match the output shape {:?} of pooling {}",
                    input_shape, pool_output, pooling
                ),
            ));
        }
        net.insert(Unpooling {
            input_layer: input,
            input_shape,
            pooling,
            pooled_input: pool.input_layer,
            pool_size: pool.pool_size,
            stride: pool.stride,
            layout: pool.layout,
            output_shape: pool.input_shape,
        })
    }
}

impl<F: Element> Layer<F> for Unpooling {
    fn kind(&self) -> &'static str {
        "unpooling"
    }

    fn input_layer(&self) -> Option<LayerId> {
        Some(self.input_layer)
    }

    fn mb_size(&self) -> usize {
        self.layout.shape_to_c01b(self.output_shape).3
    }

    fn output_shape(&self) -> Shape4 {
        self.output_shape
    }

    fn layout(&self) -> Layout {
        self.layout
    }

    fn output(
        &self,
        net: &Network<F>,
        pass: &mut Pass<'_, F>,
        input: Option<Activations<F>>,
    ) -> Result<Activations<F>> {
        let values = net.upstream("unpooling", self.input_layer, self.input_shape, pass, input)?;
        // the maxima are pooled from this very tensor, so both agree even
        // when something stochastic sits upstream
        let original = net.output(self.pooled_input, pass)?;
        let maxima = net.output_from(self.pooling, pass, original.clone())?;

        let axes = self.layout.to_c01b_axes();
        let unpooled = unpool(
            original.view().permuted_axes(axes),
            maxima.view().permuted_axes(axes),
            values.view().permuted_axes(axes),
            self.pool_size,
            self.stride,
        );
        Ok(to_layout(unpooled, self.layout))
    }
}

/// Brings a c01b result back to `layout`, in standard memory order.
pub(crate) fn to_layout<F: Element>(c01b: Activations<F>, layout: Layout) -> Activations<F> {
    match layout {
        Layout::C01B => c01b,
        Layout::BC01 => c01b
            .permuted_axes(layout.from_c01b_axes())
            .as_standard_layout()
            .into_owned(),
    }
}

/// Pooling window `[start, end)` along an axis of length `size`.
pub(crate) fn window(index: usize, pool_size: usize, stride: usize, size: usize) -> (usize, usize) {
    let start = index * stride;
    (start, (start + pool_size).min(size))
}

/// Max pooling over the spatial axes of c01b activations.
pub fn max_pool<F: Element>(input: ArrayView4<F>, pool_size: usize, stride: usize) -> Activations<F> {
    let (channels, width, height, batch) = input.dim();
    let out_w = pool_output_size(width, pool_size, stride);
    let out_h = pool_output_size(height, pool_size, stride);
    Array4::from_shape_fn((channels, out_w, out_h, batch), |(c, i, j, b)| {
        let (x0, x1) = window(i, pool_size, stride, width);
        let (y0, y1) = window(j, pool_size, stride, height);
        input
            .slice(s![c, x0..x1, y0..y1, b])
            .fold(F::neg_infinity(), |max, &v| max.max(v))
    })
}

/// Gradient routing of max pooling, used as unpooling: every element of
/// `original` equal to the maximum of a window containing it receives that
/// window's entry of `values`. Ties all receive the value, and overlapping
/// windows accumulate.
///
/// Input:
/// -----------------------------------------------
/// - original: the pooled activations, (C, W, H, B)
/// - maxima: the result of pooling `original`, (C, W', H', B)
/// - values: what to scatter, same shape as `maxima`
///
/// Returns:
/// -----------------------------------------------
/// - out: (C, W, H, B)
pub fn unpool<F: Element>(
    original: ArrayView4<F>,
    maxima: ArrayView4<F>,
    values: ArrayView4<F>,
    pool_size: usize,
    stride: usize,
) -> Activations<F> {
    let (_, width, height, _) = original.dim();
    let mut out: Activations<F> = Array::zeros(original.raw_dim());
    for ((c, i, j, b), &max) in maxima.indexed_iter() {
        let value = values[[c, i, j, b]];
        let (x0, x1) = window(i, pool_size, stride, width);
        let (y0, y1) = window(j, pool_size, stride, height);
        for x in x0..x1 {
            for y in y0..y1 {
                if original[[c, x, y, b]] == max {
                    out[[c, x, y, b]] += value;
                }
            }
        }
    }
    out
}

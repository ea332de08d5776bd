//! Translates request descriptors into typed engine pipelines and runs them.
//!
//! Operation names resolve through one closed table. Anything outside it is
//! rejected while building the [`PipelineSpec`], before the source image is
//! fetched or the cache is touched.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream;
use tracing::{debug, instrument};

use super::stream_fanout::collect_stream;
use crate::domain::entities::{
    BooleanOperator, Channel, Color, Colorspace, ComplexParameter, Kernel, MAX_DIMENSION,
    OptionValue, Operation, Options, OutputStage, PipelineSpec, RequestDescriptor, ResizeStage,
};
use crate::domain::errors::{PipelineError, ProxyError};
use crate::domain::ports::{ByteStream, ImageEnginePort, OperandImages};

/// Size of the chunks the encoded output is served in.
pub const OUTPUT_CHUNK_SIZE: usize = 64 * 1024;

/// Typed accessor over one operation's options.
struct Params<'a> {
    operation: &'a str,
    options: &'a Options,
}

impl<'a> Params<'a> {
    const fn new(operation: &'a str, options: &'a Options) -> Self {
        Self { operation, options }
    }

    fn invalid(&self, message: impl Into<String>) -> PipelineError {
        PipelineError::invalid(self.operation, message)
    }

    fn get(&self, key: &str) -> Option<&'a OptionValue> {
        self.options.get(key)
    }

    fn number(&self, key: &str) -> Result<Option<f64>, PipelineError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.invalid(format!("{key} must be a number"))),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn float_or(&self, key: &str, default: f32) -> Result<f32, PipelineError> {
        Ok(self.number(key)?.map_or(default, |n| n as f32))
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn integer_in(&self, key: &str, min: u32, max: u32) -> Result<Option<u32>, PipelineError> {
        match self.number(key)? {
            None => Ok(None),
            Some(n) if n.fract() == 0.0 && n >= f64::from(min) && n <= f64::from(max) => {
                Ok(Some(n as u32))
            }
            Some(_) => Err(self.invalid(format!("{key} must be an integer between {min} and {max}"))),
        }
    }

    fn require<T>(&self, key: &str, value: Option<T>) -> Result<T, PipelineError> {
        value.ok_or_else(|| self.invalid(format!("{key} is required")))
    }

    fn bool_or(&self, key: &str, default: bool) -> Result<bool, PipelineError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value
                .as_bool()
                .ok_or_else(|| self.invalid(format!("{key} must be true or false"))),
        }
    }

    fn text(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| match v {
            OptionValue::Map(_) => None,
            other => Some(other.to_string()),
        })
    }

    fn color_or(&self, key: &str, default: Color) -> Result<Color, PipelineError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => self.color(key, value),
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn color(&self, key: &str, value: &OptionValue) -> Result<Color, PipelineError> {
        let bad = || self.invalid(format!("{key} must be a #hex color or r/g/b channels"));
        match value {
            OptionValue::Text(hex) => Color::from_hex(hex).ok_or_else(bad),
            OptionValue::Map(channels) => {
                let channel = |name: &str| -> Result<u8, PipelineError> {
                    match channels.get(name).and_then(OptionValue::as_f64) {
                        Some(n) if (0.0..=255.0).contains(&n) => Ok(n.round() as u8),
                        _ => Err(bad()),
                    }
                };
                let alpha = match channels.get("alpha").and_then(OptionValue::as_f64) {
                    Some(a) if (0.0..=1.0).contains(&a) => (a * 255.0).round() as u8,
                    Some(_) => return Err(bad()),
                    None => 255,
                };
                Ok(Color {
                    r: channel("r")?,
                    g: channel("g")?,
                    b: channel("b")?,
                    a: alpha,
                })
            }
            _ => Err(bad()),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn numbers(&self, key: &str) -> Result<Vec<f32>, PipelineError> {
        let items = self
            .get(key)
            .and_then(OptionValue::as_list)
            .ok_or_else(|| self.invalid(format!("{key} must be a list ({key}.0, {key}.1, ...)")))?;
        items
            .into_iter()
            .map(|v| {
                v.as_f64()
                    .map(|n| n as f32)
                    .ok_or_else(|| self.invalid(format!("{key} entries must be numbers")))
            })
            .collect()
    }

    fn colorspace(&self) -> Result<Colorspace, PipelineError> {
        let raw = self
            .text("colorspace")
            .or_else(|| self.text("colourspace"))
            .ok_or_else(|| self.invalid("colorspace is required"))?;
        Colorspace::from_name(&raw).ok_or_else(|| self.invalid(format!("unknown colorspace `{raw}`")))
    }
}

/// Builds and runs transform pipelines against an [`ImageEnginePort`].
pub struct TransformPipeline {
    engine: Arc<dyn ImageEnginePort>,
}

impl TransformPipeline {
    /// Creates a pipeline runner.
    #[must_use]
    pub fn new(engine: Arc<dyn ImageEnginePort>) -> Self {
        Self { engine }
    }

    /// Translates a descriptor into a typed pipeline.
    ///
    /// Stage order is resize, then output format, then every operation in
    /// request order.
    ///
    /// # Errors
    /// Returns [`PipelineError::UnsupportedOperation`] for names outside the
    /// operation table and [`PipelineError::InvalidParameter`] for bad
    /// options.
    pub fn build(descriptor: &RequestDescriptor) -> Result<PipelineSpec, PipelineError> {
        for (name, value) in [("width", descriptor.width()), ("height", descriptor.height())] {
            if value.is_some_and(|v| v > MAX_DIMENSION) {
                return Err(PipelineError::invalid(
                    "resize",
                    format!("{name} must be at most {MAX_DIMENSION}"),
                ));
            }
        }
        let resize = descriptor.resize().map(|r| ResizeStage {
            fit: r.fit,
            width: r.width,
            height: r.height,
        });

        let output = descriptor.output();
        let format_params = Params::new("format", &output.options);
        #[allow(clippy::cast_possible_truncation)]
        let output = OutputStage {
            format: output.format,
            quality: format_params.integer_in("quality", 1, 100)?.map(|q| q as u8),
            speed: format_params.integer_in("speed", 1, 10)?.map(|s| s as u8),
        };

        let operations = descriptor
            .operations()
            .iter()
            .map(build_operation)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PipelineSpec {
            resize,
            output,
            operations,
        })
    }

    /// Runs a pipeline over a source stream.
    ///
    /// The source is drained before decoding; the engine call runs on the
    /// blocking pool. The encoded result is returned as a chunked stream.
    ///
    /// # Errors
    /// Returns [`ProxyError::UpstreamFetch`] if the source stream fails and
    /// [`ProxyError::Transform`] if the engine does.
    #[instrument(skip_all, fields(format = %spec.output.format, operations = spec.operations.len()))]
    pub async fn run(
        &self,
        spec: PipelineSpec,
        source: ByteStream,
        operands: OperandImages,
    ) -> Result<ByteStream, ProxyError> {
        let input = collect_stream(source)
            .await
            .map_err(|e| ProxyError::upstream(format!("failed to read source image: {e}")))?;
        debug!(bytes = input.len(), "Source image buffered for decoding");

        let engine = Arc::clone(&self.engine);
        let encoded = tokio::task::spawn_blocking(move || engine.render(&spec, &input, &operands))
            .await
            .map_err(|e| ProxyError::transform(format!("engine task failed: {e}")))??;

        debug!(bytes = encoded.len(), "Pipeline produced output");
        Ok(chunked(Bytes::from(encoded)))
    }
}

fn chunked(data: Bytes) -> ByteStream {
    let chunks: Vec<std::io::Result<Bytes>> = (0..data.len())
        .step_by(OUTPUT_CHUNK_SIZE)
        .map(|start| Ok(data.slice(start..(start + OUTPUT_CHUNK_SIZE).min(data.len()))))
        .collect();
    Box::pin(stream::iter(chunks))
}

#[allow(clippy::too_many_lines, clippy::cast_possible_truncation)]
fn build_operation(param: &ComplexParameter) -> Result<Operation, PipelineError> {
    let p = Params::new(&param.name, &param.options);

    let operation = match param.name.as_str() {
        "negate" => Operation::Negate {
            alpha: p.bool_or("alpha", true)?,
        },
        "clahe" => Operation::Clahe {
            width: p.require("width", p.integer_in("width", 1, 10_000)?)?,
            height: p.require("height", p.integer_in("height", 1, 10_000)?)?,
            max_slope: p.integer_in("maxSlope", 0, 100)?.unwrap_or(3),
        },
        "convolve" => {
            let width = p.require("width", p.integer_in("width", 1, 1001)?)?;
            let height = p.require("height", p.integer_in("height", 1, 1001)?)?;
            let weights = p.numbers("kernel")?;
            if weights.len() != (width * height) as usize {
                return Err(p.invalid("kernel must have width * height entries"));
            }
            let sum: f32 = weights.iter().sum();
            let scale = p.float_or("scale", if sum == 0.0 { 1.0 } else { sum })?;
            if scale == 0.0 {
                return Err(p.invalid("scale must not be zero"));
            }
            Operation::Convolve(Kernel {
                width,
                height,
                weights,
                scale,
                offset: p.float_or("offset", 0.0)?,
            })
        }
        "modulate" => Operation::Modulate {
            brightness: p.float_or("brightness", 1.0)?,
            saturation: p.float_or("saturation", 1.0)?,
            hue: p.float_or("hue", 0.0)?,
            lightness: p.float_or("lightness", 0.0)?,
        },
        "flip" => Operation::Flip,
        "flop" => Operation::Flop,
        "normalize" | "normalise" => Operation::Normalize,
        "grayscale" | "greyscale" => Operation::Grayscale,
        "removeAlpha" => Operation::RemoveAlpha,
        "rotate" => Operation::Rotate {
            angle: p.float_or("angle", 0.0)?,
            background: p.color_or("background", Color::BLACK)?,
        },
        "threshold" => {
            let threshold = p.integer_in("threshold", 0, 255)?.unwrap_or(128) as u8;
            let grayscale = match p.get("greyscale") {
                Some(_) => p.bool_or("greyscale", true)?,
                None => p.bool_or("grayscale", true)?,
            };
            Operation::Threshold { threshold, grayscale }
        }
        "boolean" => {
            let operand = p.require("operand", p.text("operand"))?;
            if !(operand.starts_with("http://") || operand.starts_with("https://")) {
                return Err(p.invalid("operand must be an http(s) image URL"));
            }
            let raw = p.require("operator", p.text("operator"))?;
            let operator = BooleanOperator::from_name(&raw)
                .ok_or_else(|| p.invalid(format!("operator must be and, or or eor, got `{raw}`")))?;
            Operation::Boolean { operand, operator }
        }
        "linear" => Operation::Linear {
            a: p.float_or("a", 1.0)?,
            b: p.float_or("b", 0.0)?,
        },
        "recomb" => {
            let rows = p
                .get("matrix")
                .and_then(OptionValue::as_list)
                .filter(|rows| rows.len() == 3)
                .ok_or_else(|| p.invalid("matrix must be 3x3 (matrix.0.0 ... matrix.2.2)"))?;
            let mut matrix = [[0.0_f32; 3]; 3];
            for (row, value) in matrix.iter_mut().zip(rows) {
                let cells = value
                    .as_list()
                    .filter(|cells| cells.len() == 3)
                    .ok_or_else(|| p.invalid("matrix rows must have 3 entries"))?;
                for (cell, v) in row.iter_mut().zip(cells) {
                    let n = v.as_f64().ok_or_else(|| p.invalid("matrix entries must be numbers"))? as f32;
                    *cell = n;
                }
            }
            Operation::Recomb(matrix)
        }
        "sharpen" => {
            let sigma = p.number("sigma")?;
            if sigma.is_some_and(|s| !(0.01..=10_000.0).contains(&s)) {
                return Err(p.invalid("sigma must be between 0.01 and 10000"));
            }
            Operation::Sharpen {
                sigma: sigma.map(|s| s as f32),
                flat: p.float_or("flat", 1.0)?,
                jagged: p.float_or("jagged", 2.0)?,
            }
        }
        "median" | "media" => Operation::Median {
            size: p.integer_in("size", 1, 1000)?.unwrap_or(3),
        },
        "blur" => {
            let sigma = p.number("sigma")?;
            if sigma.is_some_and(|s| !(0.3..=1000.0).contains(&s)) {
                return Err(p.invalid("sigma must be between 0.3 and 1000"));
            }
            Operation::Blur {
                sigma: sigma.map(|s| s as f32),
            }
        }
        "flatten" => Operation::Flatten {
            background: p.color_or("background", Color::BLACK)?,
        },
        "gamma" => {
            let gamma = p.float_or("gamma", 2.2)?;
            let gamma_out = p.float_or("gammaOut", gamma)?;
            if !(1.0..=3.0).contains(&gamma) || !(1.0..=3.0).contains(&gamma_out) {
                return Err(p.invalid("gamma must be between 1.0 and 3.0"));
            }
            Operation::Gamma { gamma, gamma_out }
        }
        "tint" => {
            let value = p.require("rgb", p.get("rgb"))?;
            Operation::Tint(p.color("rgb", value)?)
        }
        "pipelineColorspace" | "pipelineColourspace" => {
            Operation::PipelineColorspace(p.colorspace()?)
        }
        "toColorspace" | "toColourspace" => Operation::ToColorspace(p.colorspace()?),
        "ensureAlpha" => {
            let alpha = p.float_or("alpha", 1.0)?;
            if !(0.0..=1.0).contains(&alpha) {
                return Err(p.invalid("alpha must be between 0 and 1"));
            }
            Operation::EnsureAlpha { alpha }
        }
        "extractChannel" => {
            let raw = p.require("channel", p.text("channel"))?;
            Operation::ExtractChannel(
                Channel::from_name(&raw)
                    .ok_or_else(|| p.invalid(format!("unknown channel `{raw}`")))?,
            )
        }
        other => return Err(PipelineError::unsupported(other)),
    };

    Ok(operation)
}

//! Domain entity definitions.

mod cache_key;
mod descriptor;
mod format;
mod options;
mod pipeline_spec;

pub use cache_key::CacheKey;
pub use descriptor::{
    ComplexParameter, DescriptorRules, OutputFormat, RequestDescriptor, ResizeSpec, UrlCleanMode,
};
pub use format::{FitMode, ImageFormat};
pub use options::{OptionKeyConflict, OptionValue, Options, flatten, format_number, unflatten};
pub use pipeline_spec::{
    BooleanOperator, Channel, Color, Colorspace, Kernel, MAX_DIMENSION, Operation, OutputStage,
    PipelineSpec, ResizeStage,
};

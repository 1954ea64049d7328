/// Service layer
///
/// - `upload`: producer side (validate, store, record, publish)
/// - `queue`: job queue backends and the consumer loop
/// - `processor`: worker side (thumbnails, recompression, DONE/ERROR)
/// - `transform`: the image transform engine
/// - `reconcile`: orphaned blob cleanup
pub mod processor;
pub mod queue;
pub mod reconcile;
pub mod transform;
pub mod upload;

pub use processor::{HandleOutcome, JobProcessor, ProcessError, ProcessorConfig};
pub use reconcile::{ReconcileReport, Reconciler};
pub use transform::{ImageInfo, ImageTransformer, TransformError};
pub use upload::{UploadPolicy, UploadReceipt, UploadService};

pub mod body;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod service;
pub mod types;
pub mod url;

pub use dispatcher::{Destination, DispatchBatch, Dispatcher, NotifyOptions, Response, ResultSink};
pub use error::{NotifyError, NotifyResult};
pub use registry::{RegistryError, ServiceEntry, ServiceRegistry};
pub use service::{AttachmentSupport, NotificationService, ServiceContext};
pub use types::{BodyFormat, Color, NotificationRequest, NotifyType};
pub use url::{ServiceUrl, UrlBuilder};

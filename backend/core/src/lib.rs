pub mod error;
pub mod traits;
pub mod tuple;
pub mod types;

pub use error::{BackendError, GraphError, ProxyError};
pub use traits::{
    ListFilter, PermissionGraph, ResourceBackend, WatchEvent, WatchEventType, WatchStream,
};
pub use tuple::{
    Permissionship, Precondition, PreconditionKind, RelationshipFilter, RelationshipTuple,
    RelationshipWrite, SubjectRef, TupleParseError, WriteOutcome,
};
pub use types::{
    extract_path, sanitize_user_name, ContextField, ObjectName, RequestContext, ResourceKey,
    ResourceKind, UserInfo, Verb,
};

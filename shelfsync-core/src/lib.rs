mod dms;
mod error;
mod workspace;

pub use dms::{
    Correspondent, DmsClient, DmsError, Document, DocumentFile, DocumentPage, Tag,
};
pub use error::ApiErrorClass;
pub use workspace::{SOURCE_ID_PROPERTY, WorkspaceClient, WorkspaceError};

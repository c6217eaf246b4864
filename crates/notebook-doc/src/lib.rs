//! Notebook documents and the outputs kernels produce.
//!
//! [`Output`] is the typed form of one kernel output, [`Document`] the typed
//! form of an `.ipynb` file. Both convert losslessly to and from their
//! on-disk JSON records.

pub mod cell;
pub mod document;
pub mod error;
pub mod mime;
pub mod multiline;
pub mod output;

pub use cell::{Cell, CellKind};
pub use document::{Document, DocumentChange};
pub use error::DocError;
pub use mime::{MimeBundle, MimeRepresentation};
pub use multiline::MultilineString;
pub use output::{ExecutionSummary, Output, OutputType};

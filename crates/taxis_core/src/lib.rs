pub mod error;
pub mod graph;
pub mod ids;
pub mod model;
pub mod payload;
pub mod processor;
pub mod statement;
pub mod time;
pub mod value;

pub use error::{ErrorCode, Feedback, TaxisError, TaxisResult};
pub use graph::*;
pub use ids::*;
pub use model::*;
pub use payload::{Coercer, DefaultCoercer, IdentifierProvider, Payload, UuidIdentifierProvider};
pub use processor::*;
pub use statement::*;
pub use time::*;
pub use value::*;

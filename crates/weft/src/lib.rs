//! Arena-based reactive field graph for scene engines.
//!
//! Fields are typed cells owned by nodes; routes carry change events
//! between them. Propagation is split in two halves: a push phase stamps
//! downstream fields as pending (cycle-safe, no recomputation), and a
//! pull phase recomputes a field's value on demand from its pending
//! source. On top of that sit per-field access types enforced against
//! node ownership, draw caching with churn damping and child-readiness
//! gating, a tick driver, and thread mirrors for feeding the graph from
//! outside.
//!
//! ```
//! use weft::{FieldDef, Graph, TypeTag, Value};
//!
//! let mut graph = Graph::new();
//! let celsius = graph.add(FieldDef::new("celsius", TypeTag::Float));
//! let fahrenheit = graph.add(
//!     FieldDef::new("fahrenheit", TypeTag::Float)
//!         .map(|inputs| match inputs[0] {
//!             Value::Float(c) => Value::Float(c * 9.0 / 5.0 + 32.0),
//!             _ => Value::Unit,
//!         }),
//! );
//! graph.route(celsius, fahrenheit, None).unwrap();
//! graph.set(celsius, Value::Float(100.0), None).unwrap();
//! assert_eq!(graph.get(fahrenheit, None).unwrap(), Value::Float(212.0));
//! ```

pub mod arena;
pub mod cache;
pub mod error;
pub mod field;
pub mod graph;
pub mod mirror;
pub mod node;
mod routing;
pub mod scene;
pub mod snapshot;
pub mod value;

pub use arena::FieldId;
pub use cache::{ArtifactId, CacheMode, CacheOptions, RenderBackend, DEFAULT_CACHE_DELAY};
pub use error::{AccessError, CacheBuildFailure, GraphError};
pub use field::{Access, Event, FieldDef, Notify, Phase, Stamp, UpdateRule};
pub use graph::Graph;
pub use mirror::{MirrorField, MirrorHandle};
pub use node::{NodeId, NodeInfo};
pub use scene::{PullPolicy, Scene};
pub use snapshot::{GraphSnapshot, RestoreError};
pub use value::{TypeTag, Value};

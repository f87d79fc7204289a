pub mod derive;
pub mod ids;
pub mod job;
pub mod knowledge_base;
pub mod stix;
pub mod time_serde;
pub mod version;

pub use ids::ParsedId;
pub use job::{Job, JobState, JobType, TransitionError};
pub use knowledge_base::{Form, FormClause, KnowledgeBase, ProcessorMode};
pub use version::{VersionTag, natural_cmp};

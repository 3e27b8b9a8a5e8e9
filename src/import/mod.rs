//! Lead import and deduplication engine.
//!
//! Pipeline, in order:
//!
//! 1. **Decoding** (`decoder`) - delimited text or spreadsheet into header-keyed rows
//! 2. **Consolidation** (`rules`, `consolidator`) - redundant columns collapse into one record
//! 3. **Phone normalization** (`phone`) - canonical digits, the deduplication key
//! 4. **Resolution** (`resolver`) - new, merge or skip against stored leads and this run
//! 5. **Distribution** (`distribution`) - round-robin, fixed or no assignee
//! 6. **Tagging** (`tags`) - one tag per run, linked once per lead
//! 7. **Persistence** (`persister`) - bounded concurrent writes per batch
//! 8. **Coordination** (`coordinator`) - runs the above and tallies the result
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use lead_import::import::{ImportRequest, LeadImporter, NoProgress, RuleRegistry};
//!
//! let importer = LeadImporter::new(repository, Arc::new(RuleRegistry::builtin()?), config);
//! let result = importer
//!     .run(&request, Path::new("leads.csv"), &NoProgress, CancellationToken::new())
//!     .await?;
//!
//! println!("imported {}, updated {}", result.imported, result.updated);
//! ```

pub mod consolidator;
pub mod coordinator;
pub mod data_structures;
pub mod decoder;
pub mod distribution;
pub mod jobs;
pub mod persister;
pub mod phone;
pub mod progress;
pub mod repository;
pub mod resolver;
pub mod rules;
pub mod stats;
pub mod tags;

pub use coordinator::{ImportError, ImportRequest, LeadImporter};
pub use decoder::FileFormat;
pub use distribution::DistributionMode;
pub use jobs::{JobRegistry, JobSnapshot, JobStatus};
pub use progress::{NoProgress, ProgressSink};
pub use repository::{LeadRepository, PgLeadRepository, RepositoryError};
pub use rules::RuleRegistry;
pub use stats::ImportResult;

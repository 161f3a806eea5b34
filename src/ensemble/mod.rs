pub mod manager;
pub mod scorer;

pub use manager::{ModelManager, ModelManagerConfig, RankedPredictions, TrainingStatus};
pub use scorer::{Scorer, ScorerKind, ScorerOutput, ScorerState};

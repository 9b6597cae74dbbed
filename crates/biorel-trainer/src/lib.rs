//! # Biorel Trainer
//!
//! Joint multi-corpus training for biorel extraction models: JSON-lines
//! data loading, flat and continual epoch plans with per-corpus classifier
//! gating, one AdamW optimizer per parameter group with warm-up schedules,
//! EMA-weighted validation, early stopping and safetensors checkpoints.
//!
//! The `train` binary wraps [`run_training`].

pub mod checkpoint;
pub mod config;
pub mod curriculum;
pub mod data;
pub mod ema;
pub mod error;
pub mod model;
pub mod schedule;
pub mod scorer;
pub mod trainer;

use std::path::Path;

use biorel_core::Task;
use candle_core::Device;

pub use config::{TrainingConfig, TrainingMode};
pub use error::TrainerError;
pub use model::JointModel;
pub use trainer::{Evaluation, TrainingScheduler, TrainingSummary};

use data::{CorpusCatalog, Dataset, load_records, relation_statistics};

/// Evaluations gathered by [`run_training`], one entry per run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    /// Best validation scores of runs that saved a checkpoint.
    pub best_valid: Vec<Evaluation>,
    pub test: Vec<Evaluation>,
}

/// Trains `config.average_runs` models, or with `test_checkpoint` only
/// scores the test split with a saved checkpoint.
pub fn run_training(
    config: &TrainingConfig,
    test_checkpoint: Option<&Path>,
) -> anyhow::Result<RunReport> {
    config.validate()?;
    let catalog = CorpusCatalog::from_file(&config.catalog_file, &config.corpora)?;
    let device = Device::Cpu;

    if let Some(checkpoint_dir) = test_checkpoint {
        let test_file = config
            .test_file
            .as_ref()
            .ok_or_else(|| TrainerError::invalid("test mode needs a test_file"))?;
        let test = load_split(test_file, &catalog)?;
        let model = JointModel::build(config, &catalog, &device)?;
        let mut scheduler = TrainingScheduler::new(config.clone(), catalog, model, 0)?;
        let evaluation = scheduler.test(checkpoint_dir, &test)?;
        trainer::log_evaluation("test", &evaluation);
        return Ok(RunReport {
            best_valid: Vec::new(),
            test: vec![evaluation],
        });
    }

    let train = load_split(&config.train_file, &catalog)?;
    let valid = load_split(&config.valid_file, &catalog)?;
    tracing::info!(
        train = train.len(),
        valid = valid.len(),
        mode = %config.mode,
        representation = %config.representation,
        "loaded datasets"
    );
    if train.is_empty() {
        anyhow::bail!("no training records in {}", config.train_file.display());
    }

    let relation_ids: Vec<String> = catalog
        .labels(Task::Relation)
        .iter()
        .map(|label| Task::Relation.sub_task(label))
        .collect();
    for stats in relation_statistics(&train, &relation_ids) {
        tracing::info!(
            sub_task = %stats.sub_task,
            yes = stats.yes,
            share = stats.share,
            yes_ratio = stats.yes_no[1],
            "label statistics"
        );
    }

    let stop_task = config.early_stop_task();
    let mut report = RunReport::default();
    for run in 0..config.average_runs {
        let run_config = TrainingConfig {
            seed: config.seed.wrapping_add(run as u64),
            output_dir: config
                .output_dir
                .as_ref()
                .map(|dir| if config.average_runs > 1 { dir.join(format!("run-{run}")) } else { dir.clone() }),
            ..config.clone()
        };
        tracing::info!(run, seed = run_config.seed, "starting run");

        let model = JointModel::build(&run_config, &catalog, &device)?;
        let mut scheduler =
            TrainingScheduler::new(run_config.clone(), catalog.clone(), model, train.len())?;
        let summary = scheduler.fit(&train, &valid)?;
        tracing::info!(
            run,
            epochs = summary.epochs_run,
            stop = ?summary.stop,
            best_epoch = ?summary.best_epoch,
            "run finished"
        );
        if let Some(best) = &summary.best {
            trainer::log_evaluation("best-valid", best);
            report.best_valid.push(best.clone());
        }

        if let (Some(test_file), Some(dir)) = (&run_config.test_file, &run_config.output_dir) {
            if summary.best.is_none() {
                tracing::warn!(run, "no checkpoint was saved, skipping the test split");
                continue;
            }
            let test = load_split(test_file, &catalog)?;
            let evaluation = scheduler.test(dir.join(trainer::BEST_CHECKPOINT), &test)?;
            trainer::log_evaluation("test", &evaluation);
            report.test.push(evaluation);
        }
    }

    if !report.best_valid.is_empty() {
        let runs = report.best_valid.len();
        let mean = report.best_valid.iter().map(|e| e.f1(stop_task)).sum::<f64>() / runs as f64;
        tracing::info!(runs, task = %stop_task, mean_f1 = mean, "averaged best F1");
    }
    Ok(report)
}

fn load_split(path: &Path, catalog: &CorpusCatalog) -> Result<Dataset, TrainerError> {
    let records = load_records(path)?;
    Dataset::from_records(&records, catalog, &catalog.labels(Task::EntityType))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::small_config;
    use std::path::PathBuf;

    const CATALOG: &str = r#"{
        "DDI": {"id_prefix": "11111", "entity_types": ["Drug"], "relations": ["interaction", "effect"]},
        "CPR": {"id_prefix": "22222", "entity_types": ["Chemical", "Gene"], "relations": ["inhibitor"]}
    }"#;

    const RECORDS: &str = r#"{"id": "11111-1", "tokens": [5, 6, 7], "entities": [[0, 0], [2, 2]], "entity_types": {"Drug": [[0, 0], [2, 2]]}, "relations": {"interaction": [[[0, 0], [2, 2]]]}}
{"id": "11111-2", "tokens": [8, 9, 10, 11], "entities": [[0, 0], [3, 3]], "relations": {"effect": [[[0, 0], [3, 3]]]}}
{"id": "22222-1", "tokens": [12, 13, 14], "entities": [[0, 0], [2, 2]], "entity_types": {"Chemical": [[0, 0]], "Gene": [[2, 2]]}, "relations": {"inhibitor": [[[0, 0], [2, 2]]]}}
"#;

    fn workspace(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("biorel-run-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("corpora.json"), CATALOG).unwrap();
        for split in ["train", "valid", "test"] {
            std::fs::write(dir.join(format!("{split}.jsonl")), RECORDS).unwrap();
        }
        dir
    }

    fn config(dir: &Path) -> TrainingConfig {
        TrainingConfig {
            train_file: dir.join("train.jsonl"),
            valid_file: dir.join("valid.jsonl"),
            test_file: Some(dir.join("test.jsonl")),
            catalog_file: dir.join("corpora.json"),
            output_dir: Some(dir.join("out")),
            max_epochs: 2,
            batch_size: 2,
            ..small_config()
        }
    }

    #[test]
    fn repeated_runs_save_and_test_their_own_checkpoints() {
        let dir = workspace("repeated");
        let config = TrainingConfig {
            average_runs: 2,
            ..config(&dir)
        };

        let report = run_training(&config, None).unwrap();
        assert_eq!(report.best_valid.len(), 2);
        assert_eq!(report.test.len(), 2);
        for run in 0..2 {
            let best = dir.join("out").join(format!("run-{run}")).join(trainer::BEST_CHECKPOINT);
            assert!(best.join(checkpoint::MANIFEST_FILE).is_file());
            assert!(best.join(checkpoint::MODEL_FILE).is_file());
        }
        assert!(report.test[0].scores.contains_key(&Task::Relation));

        let best = dir.join("out").join("run-0").join(trainer::BEST_CHECKPOINT);
        let scored = run_training(&config, Some(&best)).unwrap();
        assert!(scored.best_valid.is_empty());
        assert_eq!(scored.test.len(), 1);
        assert!(scored.test[0].scores.contains_key(&Task::EntityType));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn single_run_writes_directly_into_the_output_dir() {
        let dir = workspace("single");
        let report = run_training(&config(&dir), None).unwrap();
        assert_eq!(report.test.len(), 1);
        assert!(
            dir.join("out")
                .join(trainer::BEST_CHECKPOINT)
                .join(checkpoint::MANIFEST_FILE)
                .is_file()
        );
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_mode_needs_a_test_file() {
        let dir = workspace("no-test-file");
        let config = TrainingConfig {
            test_file: None,
            ..config(&dir)
        };
        let err = run_training(&config, Some(&dir.join("out"))).unwrap_err();
        assert!(err.to_string().contains("test_file"));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}

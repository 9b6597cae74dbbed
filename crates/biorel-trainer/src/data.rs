//! Data loading: JSON-lines records, the corpus catalog, batching and
//! label statistics.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use biorel_core::{Record, Sentence, Task};
use oorandom::Rand32;
use serde::{Deserialize, Serialize};

use crate::error::TrainerError;

/// Label vocabulary of one corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorpusInfo {
    /// Record ids of this corpus start with this prefix.
    pub id_prefix: String,
    #[serde(default)]
    pub entity_types: Vec<String>,
    #[serde(default)]
    pub relations: Vec<String>,
}

/// The configured corpora, in turn order.
#[derive(Debug, Clone, PartialEq)]
pub struct CorpusCatalog {
    corpora: Vec<(String, CorpusInfo)>,
}

impl CorpusCatalog {
    /// Reads a catalog file and keeps the corpora named in `selected`, in
    /// that order.
    pub fn from_file<P: AsRef<Path>>(path: P, selected: &[String]) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let all: BTreeMap<String, CorpusInfo> = serde_json::from_str(&text).map_err(|e| {
            TrainerError::invalid(format!("{}: {e}", path.as_ref().display()))
        })?;
        Ok(Self::select(&all, selected)?)
    }

    pub fn select(
        all: &BTreeMap<String, CorpusInfo>,
        selected: &[String],
    ) -> Result<Self, TrainerError> {
        let corpora = selected
            .iter()
            .map(|name| {
                all.get(name)
                    .cloned()
                    .map(|info| (name.clone(), info))
                    .ok_or_else(|| TrainerError::invalid(format!("corpus {name:?} is not in the catalog")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { corpora })
    }

    pub fn info(&self, corpus: &str) -> Option<&CorpusInfo> {
        self.corpora
            .iter()
            .find(|(name, _)| name == corpus)
            .map(|(_, info)| info)
    }

    /// Corpus a record id belongs to.
    pub fn corpus_of(&self, id: &str) -> Result<&str, TrainerError> {
        self.corpora
            .iter()
            .find(|(_, info)| id.starts_with(&info.id_prefix))
            .map(|(name, _)| name.as_str())
            .ok_or_else(|| TrainerError::UnknownCorpus { id: id.to_string() })
    }

    /// Union of one task's labels over all corpora, in first-seen order.
    pub fn labels(&self, task: Task) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.corpora
            .iter()
            .flat_map(|(_, info)| corpus_labels(info, task))
            .filter(|label| seen.insert(label.as_str()))
            .cloned()
            .collect()
    }

    /// Sub-task ids one corpus annotates for a task.
    pub fn sub_tasks_of(&self, corpus: &str, task: Task) -> BTreeSet<String> {
        self.info(corpus)
            .map(|info| {
                corpus_labels(info, task)
                    .iter()
                    .map(|label| task.sub_task(label))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn corpus_labels(info: &CorpusInfo, task: Task) -> &[String] {
    match task {
        Task::EntityType => &info.entity_types,
        Task::Relation => &info.relations,
    }
}

/// Reads one record per line. Blank lines and `#` comments are skipped.
pub fn load_records<P: AsRef<Path>>(path: P) -> Result<Vec<Record>, TrainerError> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);

    let mut records = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let record = serde_json::from_str(line).map_err(|e| TrainerError::Data {
            path: path.to_path_buf(),
            line: i + 1,
            message: e.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Sentences of one split with their corpus assignment.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub sentences: Vec<Sentence>,
    /// Corpus name per sentence.
    pub corpora: Vec<String>,
}

impl Dataset {
    pub fn from_records(
        records: &[Record],
        catalog: &CorpusCatalog,
        entity_type_labels: &[String],
    ) -> Result<Self, TrainerError> {
        let mut sentences = Vec::with_capacity(records.len());
        let mut corpora = Vec::with_capacity(records.len());
        for record in records {
            corpora.push(catalog.corpus_of(&record.id)?.to_string());
            sentences.push(Sentence::from_record(record, entity_type_labels)?);
        }
        Ok(Self { sentences, corpora })
    }

    pub fn len(&self) -> usize {
        self.sentences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    /// Sentence indices chunked into batches, shuffled when `rng` is given.
    pub fn batches(&self, batch_size: usize, rng: Option<&mut Rand32>) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if let Some(rng) = rng {
            shuffle(&mut order, rng);
        }
        order
            .chunks(batch_size.max(1))
            .map(<[usize]>::to_vec)
            .collect()
    }

    /// Clones the sentences of one batch.
    pub fn batch(&self, indices: &[usize]) -> Vec<Sentence> {
        indices.iter().map(|&i| self.sentences[i].clone()).collect()
    }
}

/// Fisher-Yates shuffle.
pub fn shuffle<T>(items: &mut [T], rng: &mut Rand32) {
    for i in (1..items.len()).rev() {
        let j = rng.rand_range(0..(i as u32 + 1)) as usize;
        items.swap(i, j);
    }
}

/// Yes/no balance of one relation sub-task on the training split.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelStatistics {
    pub sub_task: String,
    pub yes: usize,
    /// Share of this sub-task among all gold relation pairs.
    pub share: f64,
    /// `[no, yes]` ratios over all candidate pairs.
    pub yes_no: [f64; 2],
}

/// Counts gold pairs per relation sub-task against all candidate pairs.
pub fn relation_statistics(dataset: &Dataset, sub_tasks: &[String]) -> Vec<LabelStatistics> {
    let candidates: usize = dataset.sentences.iter().map(Sentence::pair_count).sum();
    let yes: Vec<usize> = sub_tasks
        .iter()
        .map(|id| {
            dataset
                .sentences
                .iter()
                .map(|s| s.gold_relations.get(id).map_or(0, Vec::len))
                .sum()
        })
        .collect();
    let total_yes: usize = yes.iter().sum();

    sub_tasks
        .iter()
        .zip(yes)
        .map(|(id, count)| {
            let ratio = if candidates > 0 {
                count as f64 / candidates as f64
            } else {
                0.0
            };
            LabelStatistics {
                sub_task: id.clone(),
                yes: count,
                share: if total_yes > 0 {
                    count as f64 / total_yes as f64
                } else {
                    0.0
                },
                yes_no: [1.0 - ratio, ratio],
            }
        })
        .collect()
}

//! The jointly trained model: one shared encoder feeding one classifier
//! ensemble per task.
//!
//! Parameters live in one [`VarMap`] per optimizer group: `shared` holds
//! the encoder and the pair projection, and every task owns its own map.
//! Qualified parameter names are `<group>.<name inside the map>`.

use std::collections::{BTreeMap, BTreeSet};

use biorel_core::encoder::distilbert::ENCODER_PREFIX;
use biorel_core::{
    DistilBertEncoder, EnsembleClassifier, EnsembleConfig, EntityPairEncoder, GoldAligner,
    LiteEncoder, MarkerVocab, Sentence, SequenceEncoder, Span, SpanPair, Task,
};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use crate::config::{EncoderSettings, TrainingConfig};
use crate::data::CorpusCatalog;
use crate::error::TrainerError;
use crate::scorer::SubTaskResults;

/// Optimizer group of the encoder and pair projection.
pub const SHARED_GROUP: &str = "shared";

/// A parameter with its qualified name.
#[derive(Debug, Clone)]
pub struct NamedVar {
    pub name: String,
    pub var: Var,
    /// Set when the parameter belongs to a gated-out classifier.
    pub frozen: bool,
}

/// Loss and per-sentence results of one task on one batch.
#[derive(Debug)]
pub struct TaskOutput<K> {
    /// `None` when the batch gave the task nothing to learn from.
    pub loss: Option<Tensor>,
    pub results: Vec<SubTaskResults<K>>,
}

#[derive(Debug)]
pub struct BatchOutput {
    pub relation: TaskOutput<SpanPair>,
    pub entity_type: Option<TaskOutput<Span>>,
}

impl BatchOutput {
    pub fn loss(&self, task: Task) -> Option<&Tensor> {
        match task {
            Task::Relation => self.relation.loss.as_ref(),
            Task::EntityType => self.entity_type.as_ref().and_then(|o| o.loss.as_ref()),
        }
    }
}

struct TaskHead {
    ensemble: EnsembleClassifier,
    aligner: GoldAligner,
    vars: VarMap,
}

pub struct JointModel {
    encoder: Box<dyn SequenceEncoder>,
    pairs: EntityPairEncoder,
    heads: BTreeMap<Task, TaskHead>,
    shared_vars: VarMap,
    device: Device,
}

impl JointModel {
    /// Builds the encoder and one ensemble per configured task, with label
    /// vocabularies taken from the catalog.
    pub fn build(
        config: &TrainingConfig,
        catalog: &CorpusCatalog,
        device: &Device,
    ) -> Result<Self, TrainerError> {
        let entity_types = catalog.labels(Task::EntityType);
        let shared_vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&shared_vars, DType::F32, device);

        let (encoder, markers): (Box<dyn SequenceEncoder>, MarkerVocab) = match &config.encoder {
            EncoderSettings::Lite {
                vocab_size,
                hidden_size,
                max_positions,
                pad_id,
            } => {
                let markers = MarkerVocab::grow(*vocab_size, &entity_types);
                let encoder = LiteEncoder::new(
                    markers.vocab_size(),
                    *hidden_size,
                    *max_positions,
                    *pad_id,
                    vb.pp(ENCODER_PREFIX),
                )?;
                (Box::new(encoder) as Box<dyn SequenceEncoder>, markers)
            }
            EncoderSettings::DistilBert { model_dir } => {
                let encoder = DistilBertEncoder::load(model_dir, &entity_types, &shared_vars, device)?;
                let markers = encoder.markers().clone();
                (Box::new(encoder) as Box<dyn SequenceEncoder>, markers)
            }
        };

        let hidden_size = encoder.hidden_size();
        let pairs = EntityPairEncoder::new(config.representation, markers, hidden_size, vb)?;

        let mut heads = BTreeMap::new();
        for &task in &config.tasks {
            let labels = catalog.labels(task);
            let input_dim = match task {
                Task::EntityType => hidden_size,
                Task::Relation => pairs.output_dim(),
            };
            let vars = VarMap::new();
            let ensemble = EnsembleClassifier::new(
                EnsembleConfig::new(task, labels, input_dim)
                    .with_loss_policy(config.loss_policy)
                    .with_class_weights(config.class_weights),
                VarBuilder::from_varmap(&vars, DType::F32, device),
            )?;
            let aligner = GoldAligner::new(ensemble.sub_tasks().to_vec());
            tracing::info!(
                task = %task,
                sub_tasks = ensemble.sub_tasks().len(),
                input_dim,
                "built classifier ensemble"
            );
            heads.insert(
                task,
                TaskHead {
                    ensemble,
                    aligner,
                    vars,
                },
            );
        }
        if !heads.contains_key(&Task::Relation) {
            return Err(TrainerError::invalid("the relation task is required"));
        }

        Ok(Self {
            encoder,
            pairs,
            heads,
            shared_vars,
            device: device.clone(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn tasks(&self) -> impl Iterator<Item = Task> + '_ {
        self.heads.keys().copied()
    }

    pub fn ensemble(&self, task: Task) -> Option<&EnsembleClassifier> {
        self.heads.get(&task).map(|head| &head.ensemble)
    }

    /// Sub-task ids of every task, in ensemble order.
    pub fn sub_tasks(&self) -> BTreeMap<Task, Vec<String>> {
        self.heads
            .iter()
            .map(|(task, head)| (*task, head.ensemble.sub_tasks().to_vec()))
            .collect()
    }

    pub fn shared_vars(&self) -> &VarMap {
        &self.shared_vars
    }

    pub fn task_vars(&self, task: Task) -> Option<&VarMap> {
        self.heads.get(&task).map(|head| &head.vars)
    }

    /// Every parameter, sorted by qualified name within each group.
    pub fn parameters(&self) -> Result<Vec<NamedVar>, TrainerError> {
        let mut params = collect_vars(SHARED_GROUP, &self.shared_vars, &[])?;
        for (task, head) in &self.heads {
            let frozen = head.ensemble.frozen();
            params.extend(collect_vars(task.as_str(), &head.vars, &frozen)?);
        }
        Ok(params)
    }

    /// Freezes every classifier whose sub-task is not in `keep`. Returns the
    /// sub-tasks this call froze, for [`JointModel::unfreeze`].
    pub fn freeze_except(&mut self, keep: &BTreeSet<String>) -> Result<Vec<String>, TrainerError> {
        let mut frozen = Vec::new();
        for head in self.heads.values_mut() {
            let already: BTreeSet<String> =
                head.ensemble.frozen().into_iter().map(str::to_string).collect();
            let targets: Vec<String> = head
                .ensemble
                .sub_tasks()
                .iter()
                .filter(|id| !keep.contains(*id) && !already.contains(*id))
                .cloned()
                .collect();
            for id in targets {
                head.ensemble.set_requires_grad(&id, false)?;
                frozen.push(id);
            }
        }
        Ok(frozen)
    }

    pub fn unfreeze(&mut self, sub_tasks: &[String]) -> Result<(), TrainerError> {
        for id in sub_tasks {
            let head = self
                .heads
                .values_mut()
                .find(|head| head.ensemble.sub_tasks().contains(id))
                .ok_or_else(|| biorel_core::BiorelError::UnknownSubTask(id.clone()))?;
            head.ensemble.set_requires_grad(id, true)?;
        }
        Ok(())
    }

    /// One forward pass over a batch: losses, gold sets and predictions for
    /// every task.
    pub fn forward(&self, batch: &[Sentence]) -> Result<BatchOutput, TrainerError> {
        let relation = self.forward_relations(batch)?;
        let entity_type = match self.heads.get(&Task::EntityType) {
            Some(head) => Some(self.forward_entity_types(head, batch)?),
            None => None,
        };
        Ok(BatchOutput {
            relation,
            entity_type,
        })
    }

    fn forward_relations(&self, batch: &[Sentence]) -> Result<TaskOutput<SpanPair>, TrainerError> {
        let head = self
            .heads
            .get(&Task::Relation)
            .ok_or_else(|| TrainerError::invalid("the relation task is required"))?;

        let encoding = self.pairs.encode_pairs(self.encoder.as_ref(), batch)?;
        let output = head.ensemble.decide(&encoding.pair_vectors)?;
        let annotations: Vec<_> = batch.iter().map(|s| &s.gold_relations).collect();
        let alignment = head.aligner.align(
            &annotations,
            &encoding.raw_pairs,
            &encoding.pair_counts,
            &self.device,
        )?;
        let loss = head.ensemble.loss(&output.logits, &alignment.labels)?;
        let predicted = head
            .ensemble
            .predicted_sets(&output.fused, &encoding.raw_pairs);

        Ok(TaskOutput {
            loss: Some(loss),
            results: pair_up(alignment.gold_sets, predicted),
        })
    }

    fn forward_entity_types(
        &self,
        head: &TaskHead,
        batch: &[Sentence],
    ) -> Result<TaskOutput<Span>, TrainerError> {
        if batch.iter().all(|s| s.entities.is_empty()) {
            let results = batch
                .iter()
                .map(|s| {
                    head.aligner
                        .gold_sets(&s.gold_entities)
                        .into_iter()
                        .map(|(id, gold)| (id, (gold, Vec::new())))
                        .collect()
                })
                .collect();
            return Ok(TaskOutput {
                loss: None,
                results,
            });
        }

        let encoding = self.pairs.encode_entities(self.encoder.as_ref(), batch)?;
        let output = head.ensemble.decide(&encoding.entity_vectors)?;
        let annotations: Vec<_> = batch.iter().map(|s| &s.gold_entities).collect();
        let alignment = head.aligner.align(
            &annotations,
            &encoding.spans,
            &encoding.entity_counts,
            &self.device,
        )?;
        let loss = head.ensemble.loss(&output.logits, &alignment.labels)?;
        let predicted = head.ensemble.predicted_sets(&output.fused, &encoding.spans);

        Ok(TaskOutput {
            loss: Some(loss),
            results: pair_up(alignment.gold_sets, predicted),
        })
    }
}

fn pair_up<K>(
    gold: Vec<BTreeMap<String, Vec<K>>>,
    predicted: Vec<BTreeMap<String, Vec<K>>>,
) -> Vec<SubTaskResults<K>> {
    gold.into_iter()
        .zip(predicted)
        .map(|(mut gold, mut predicted)| {
            gold.iter_mut()
                .map(|(id, items)| {
                    let found = predicted.remove(id).unwrap_or_default();
                    (id.clone(), (std::mem::take(items), found))
                })
                .collect()
        })
        .collect()
}

fn collect_vars(
    group: &str,
    varmap: &VarMap,
    frozen_sub_tasks: &[&str],
) -> Result<Vec<NamedVar>, TrainerError> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg(format!("{group} parameters are poisoned")))?;
    let mut params: Vec<NamedVar> = data
        .iter()
        .map(|(name, var)| NamedVar {
            name: format!("{group}.{name}"),
            var: var.clone(),
            frozen: frozen_sub_tasks
                .iter()
                .any(|id| name.strip_prefix(id).is_some_and(|rest| rest.starts_with('.'))),
        })
        .collect();
    params.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(params)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::data::CorpusInfo;
    use biorel_core::Record;

    pub(crate) fn catalog() -> CorpusCatalog {
        let all: BTreeMap<String, CorpusInfo> = serde_json::from_str(
            r#"{
                "DDI": {"id_prefix": "11111", "entity_types": ["Drug"], "relations": ["interaction", "effect"]},
                "CPR": {"id_prefix": "22222", "entity_types": ["Chemical", "Gene"], "relations": ["inhibitor"]}
            }"#,
        )
        .unwrap();
        CorpusCatalog::select(&all, &["DDI".to_string(), "CPR".to_string()]).unwrap()
    }

    pub(crate) fn small_config() -> TrainingConfig {
        TrainingConfig {
            corpora: vec!["DDI".to_string(), "CPR".to_string()],
            encoder: EncoderSettings::Lite {
                vocab_size: 64,
                hidden_size: 16,
                max_positions: 64,
                pad_id: 0,
            },
            ..TrainingConfig::default()
        }
    }

    fn sentence(json: &str, catalog: &CorpusCatalog) -> Sentence {
        let record: Record = serde_json::from_str(json).unwrap();
        Sentence::from_record(&record, &catalog.labels(Task::EntityType)).unwrap()
    }

    #[test]
    fn forward_reports_both_tasks() {
        let catalog = catalog();
        let model = JointModel::build(&small_config(), &catalog, &Device::Cpu).unwrap();
        let batch = vec![
            sentence(
                r#"{"id": "11111-1", "tokens": [5, 6, 7, 8], "entities": [[0, 0], [2, 3]],
                    "entity_types": {"Drug": [[0, 0], [2, 3]]},
                    "relations": {"interaction": [[[0, 0], [2, 3]]]}}"#,
                &catalog,
            ),
            sentence(r#"{"id": "22222-1", "tokens": [9, 10]}"#, &catalog),
        ];

        let output = model.forward(&batch).unwrap();
        assert!(output.loss(Task::Relation).is_some());
        assert!(output.loss(Task::EntityType).is_some());

        let relations = &output.relation.results;
        assert_eq!(relations.len(), 2);
        let (gold, _) = &relations[0]["relation_interaction"];
        assert_eq!(gold, &vec![SpanPair::new(Span::new(0, 0), Span::new(2, 3))]);
        assert!(relations[1]["relation_inhibitor"].0.is_empty());
    }

    #[test]
    fn entity_loss_is_skipped_without_entities() {
        let catalog = catalog();
        let model = JointModel::build(&small_config(), &catalog, &Device::Cpu).unwrap();
        let batch = vec![sentence(r#"{"id": "11111-1", "tokens": [5, 6, 7]}"#, &catalog)];

        let output = model.forward(&batch).unwrap();
        assert!(output.loss(Task::EntityType).is_none());
        assert!(output.loss(Task::Relation).is_some());
        let entity = output.entity_type.unwrap();
        assert!(entity.results[0]["entity_type_Drug"].1.is_empty());
    }

    #[test]
    fn freeze_and_unfreeze_are_reversible() {
        let catalog = catalog();
        let mut model = JointModel::build(&small_config(), &catalog, &Device::Cpu).unwrap();
        let keep = catalog.sub_tasks_of("CPR", Task::Relation);

        let frozen = model.freeze_except(&keep).unwrap();
        assert!(frozen.contains(&"relation_interaction".to_string()));
        assert!(frozen.contains(&"entity_type_Drug".to_string()));
        assert!(!frozen.contains(&"relation_inhibitor".to_string()));

        let params = model.parameters().unwrap();
        assert!(params
            .iter()
            .filter(|p| p.name.starts_with("relation.relation_interaction."))
            .all(|p| p.frozen));
        assert!(params
            .iter()
            .filter(|p| p.name.starts_with("shared."))
            .all(|p| !p.frozen));

        model.unfreeze(&frozen).unwrap();
        assert!(model.parameters().unwrap().iter().all(|p| !p.frozen));
    }

    #[test]
    fn parameter_names_are_grouped() {
        let model = JointModel::build(&small_config(), &catalog(), &Device::Cpu).unwrap();
        let names: Vec<String> = model.parameters().unwrap().into_iter().map(|p| p.name).collect();
        assert!(names.iter().any(|n| n == "shared.encoder.token_embeddings.weight"));
        assert!(names.iter().any(|n| n == "shared.pair_projection.weight"));
        assert!(names.iter().any(|n| n == "relation.relation_effect.fc1.weight"));
        assert!(names.iter().any(|n| n.starts_with("entity_type.entity_type_Gene.")));
    }
}

#![allow(dead_code)]

use std::collections::HashMap;

use aideon_taxis_core::{
    DefaultCoercer, FeedbackMode, Id, InstanceGraph, InstanceGraphCollector, Model, Payload,
    ProcessorContext, TaxisError, TaxisResult, UuidIdentifierProvider, WriteOptions,
};
use serde_json::Value as JsonValue;

pub const COMMERCE_MODEL: &str = include_str!("../../../../fixtures/commerce_model.json");

pub fn model() -> Model {
    Model::from_json(COMMERCE_MODEL).expect("fixture model")
}

pub fn payload(value: JsonValue) -> Payload {
    match value {
        JsonValue::Object(map) => map,
        other => panic!("payload must be an object, got {other}"),
    }
}

pub struct Fixture {
    pub model: Model,
    pub identifiers: UuidIdentifierProvider,
    pub coercer: DefaultCoercer,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            model: model(),
            identifiers: UuidIdentifierProvider::default(),
            coercer: DefaultCoercer,
        }
    }

    pub fn ctx(&self) -> ProcessorContext<'_> {
        ProcessorContext::new(&self.model, &self.identifiers, &self.coercer)
    }

    pub fn fail_fast(&self) -> ProcessorContext<'_> {
        self.ctx().with_options(WriteOptions {
            feedback: FeedbackMode::FailFast,
            ..WriteOptions::default()
        })
    }
}

/// Serves pre-built graphs keyed by root identifier.
#[derive(Default)]
pub struct StaticCollector {
    graphs: HashMap<Id, InstanceGraph>,
}

impl StaticCollector {
    pub fn with(mut self, graph: InstanceGraph) -> Self {
        self.graphs.insert(graph.id, graph);
        self
    }
}

impl InstanceGraphCollector for StaticCollector {
    fn collect_graph(&self, entity_type: &str, id: Id) -> TaxisResult<InstanceGraph> {
        self.graphs
            .get(&id)
            .cloned()
            .ok_or_else(|| TaxisError::not_found(format!("{entity_type} {id}")))
    }
}

//! `GET /config`: what this gateway accepts and produces.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use modelgate_common::Schema;

use crate::codec::Encoding;
use crate::config::PredictionType;
use crate::lifecycle::StageState;
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub state: StageState,
    pub thread_safe: bool,
    pub input: Schema,
    pub output: Schema,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub version: &'static str,
    /// Configured request encoding, or every supported one.
    pub input_data_formats: Vec<Encoding>,
    pub output_data_formats: Vec<Encoding>,
    pub prediction_type: PredictionType,
    pub allow_suffix_execution: bool,
    pub input: Schema,
    pub output: Schema,
    pub steps: Vec<StepDescription>,
}

fn formats(configured: Option<Encoding>) -> Vec<Encoding> {
    configured.map(|e| vec![e]).unwrap_or_else(|| Encoding::ALL.to_vec())
}

/// GET /config - pipeline schema and encodings
pub async fn config(State(state): State<Arc<AppState>>) -> Json<ConfigResponse> {
    let pipeline = state.lifecycle.pipeline();
    let states = state.lifecycle.states();
    let steps = pipeline
        .stages()
        .iter()
        .zip(states)
        .map(|(stage, (_, state))| StepDescription {
            name: stage.name().to_string(),
            kind: stage.kind(),
            state,
            thread_safe: stage.is_thread_safe(),
            input: stage.schema_in().clone(),
            output: stage.schema_out().clone(),
        })
        .collect();

    Json(ConfigResponse {
        version: env!("CARGO_PKG_VERSION"),
        input_data_formats: formats(state.config.input_data_format),
        output_data_formats: formats(state.config.output_data_format),
        prediction_type: state.config.prediction_type,
        allow_suffix_execution: state.config.pipeline.allow_suffix_execution,
        input: pipeline.schema_in(0).clone(),
        output: pipeline.schema_out().clone(),
        steps,
    })
}

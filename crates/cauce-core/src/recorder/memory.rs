//! Implementación en memoria del `AuditStore`.
//!
//! - Volátil: útil para tests y para ejecutar el motor sin base de datos.
//! - Emula los unique constraints del backend relacional devolviendo
//!   `UniqueViolation`, de modo que los invariantes se ejercitan igual que
//!   contra Postgres.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::store::AuditStore;
use super::types::*;
use crate::contracts::{BatchStatus, NodeStateStatus, RunStatus};
use crate::errors::StoreError;

#[derive(Default)]
pub struct MemoryStore {
    runs: Vec<RunRecord>,
    nodes: Vec<NodeRecord>,
    edges: Vec<EdgeRecord>,
    rows: Vec<RowRecord>,
    tokens: Vec<TokenRecord>,
    token_parents: Vec<TokenParentRecord>,
    token_outcomes: HashMap<String, TokenOutcomeRecord>,
    node_states: Vec<NodeStateRecord>,
    routing_events: Vec<RoutingEventRecord>,
    batches: Vec<BatchRecord>,
    batch_members: Vec<BatchMemberRecord>,
    artifacts: Vec<ArtifactRecord>,
    transform_errors: Vec<TransformErrorRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditStore for MemoryStore {
    fn insert_run(&mut self, run: RunRecord) -> Result<(), StoreError> {
        if self.runs.iter().any(|r| r.run_id == run.run_id) {
            return Err(StoreError::UniqueViolation(format!("run {}", run.run_id)));
        }
        self.runs.push(run);
        Ok(())
    }

    fn update_run_status(&mut self,
                         run_id: &str,
                         status: RunStatus,
                         completed_at: Option<DateTime<Utc>>)
                         -> Result<(), StoreError> {
        let run = self.runs
                      .iter_mut()
                      .find(|r| r.run_id == run_id)
                      .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
        run.status = status;
        run.completed_at = completed_at;
        Ok(())
    }

    fn insert_node(&mut self, node: NodeRecord) -> Result<(), StoreError> {
        if self.nodes.iter().any(|n| n.node_id == node.node_id) {
            return Err(StoreError::UniqueViolation(format!("node {}", node.node_id)));
        }
        self.nodes.push(node);
        Ok(())
    }

    fn insert_edge(&mut self, edge: EdgeRecord) -> Result<(), StoreError> {
        self.edges.push(edge);
        Ok(())
    }

    fn insert_row(&mut self, row: RowRecord) -> Result<(), StoreError> {
        if self.rows.iter().any(|r| r.row_id == row.row_id) {
            return Err(StoreError::UniqueViolation(format!("row {}", row.row_id)));
        }
        self.rows.push(row);
        Ok(())
    }

    fn insert_token(&mut self, token: TokenRecord) -> Result<(), StoreError> {
        if self.tokens.iter().any(|t| t.token_id == token.token_id) {
            return Err(StoreError::UniqueViolation(format!("token {}", token.token_id)));
        }
        self.tokens.push(token);
        Ok(())
    }

    fn insert_token_parent(&mut self, parent: TokenParentRecord) -> Result<(), StoreError> {
        self.token_parents.push(parent);
        Ok(())
    }

    fn insert_token_outcome(&mut self, outcome: TokenOutcomeRecord) -> Result<(), StoreError> {
        if self.token_outcomes.contains_key(&outcome.token_id) {
            return Err(StoreError::UniqueViolation(format!(
                "token_outcome {}", outcome.token_id
            )));
        }
        self.token_outcomes.insert(outcome.token_id.clone(), outcome);
        Ok(())
    }

    fn insert_node_state(&mut self, state: NodeStateRecord) -> Result<(), StoreError> {
        let dup = self.node_states.iter().any(|s| {
            s.token_id == state.token_id && s.node_id == state.node_id
            && s.attempt == state.attempt
        });
        if dup {
            return Err(StoreError::UniqueViolation(format!(
                "node_state ({}, {}, {})", state.token_id, state.node_id, state.attempt
            )));
        }
        self.node_states.push(state);
        Ok(())
    }

    fn close_node_state(&mut self,
                        state_id: &str,
                        status: NodeStateStatus,
                        output_hash: Option<String>,
                        duration_ms: Option<u64>,
                        error_json: Option<Value>,
                        context_after_json: Option<Value>,
                        completed_at: DateTime<Utc>)
                        -> Result<(), StoreError> {
        let state = self.node_states
                        .iter_mut()
                        .find(|s| s.state_id == state_id)
                        .ok_or_else(|| StoreError::NotFound(format!("node_state {state_id}")))?;
        state.status = status;
        state.output_hash = output_hash;
        state.duration_ms = duration_ms;
        state.error_json = error_json;
        state.context_after_json = context_after_json;
        state.completed_at = Some(completed_at);
        Ok(())
    }

    fn insert_routing_event(&mut self, event: RoutingEventRecord) -> Result<(), StoreError> {
        self.routing_events.push(event);
        Ok(())
    }

    fn insert_batch(&mut self, batch: BatchRecord) -> Result<(), StoreError> {
        self.batches.push(batch);
        Ok(())
    }

    fn update_batch_status(&mut self,
                           batch_id: &str,
                           status: BatchStatus,
                           trigger_reason: Option<String>,
                           completed_at: Option<DateTime<Utc>>)
                           -> Result<(), StoreError> {
        let batch = self.batches
                        .iter_mut()
                        .find(|b| b.batch_id == batch_id)
                        .ok_or_else(|| StoreError::NotFound(format!("batch {batch_id}")))?;
        batch.status = status;
        if trigger_reason.is_some() {
            batch.trigger_reason = trigger_reason;
        }
        if completed_at.is_some() {
            batch.completed_at = completed_at;
        }
        Ok(())
    }

    fn insert_batch_member(&mut self, member: BatchMemberRecord) -> Result<(), StoreError> {
        let dup = self.batch_members
                      .iter()
                      .any(|m| m.batch_id == member.batch_id && m.ordinal == member.ordinal);
        if dup {
            return Err(StoreError::UniqueViolation(format!(
                "batch_member ({}, {})", member.batch_id, member.ordinal
            )));
        }
        self.batch_members.push(member);
        Ok(())
    }

    fn insert_artifact(&mut self, artifact: ArtifactRecord) -> Result<(), StoreError> {
        self.artifacts.push(artifact);
        Ok(())
    }

    fn insert_transform_error(&mut self, error: TransformErrorRecord) -> Result<(), StoreError> {
        self.transform_errors.push(error);
        Ok(())
    }

    fn get_run(&self, run_id: &str) -> Result<RunRecord, StoreError> {
        self.runs
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))
    }

    fn list_runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        let mut runs = self.runs.clone();
        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }

    fn get_node(&self, node_id: &str) -> Result<NodeRecord, StoreError> {
        self.nodes
            .iter()
            .find(|n| n.node_id == node_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("node {node_id}")))
    }

    fn list_nodes(&self, run_id: &str) -> Result<Vec<NodeRecord>, StoreError> {
        Ok(self.nodes.iter().filter(|n| n.run_id == run_id).cloned().collect())
    }

    fn list_edges(&self, run_id: &str) -> Result<Vec<EdgeRecord>, StoreError> {
        Ok(self.edges.iter().filter(|e| e.run_id == run_id).cloned().collect())
    }

    fn get_row(&self, row_id: &str) -> Result<RowRecord, StoreError> {
        self.rows
            .iter()
            .find(|r| r.row_id == row_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("row {row_id}")))
    }

    fn list_rows(&self, run_id: &str) -> Result<Vec<RowRecord>, StoreError> {
        let mut rows: Vec<RowRecord> =
            self.rows.iter().filter(|r| r.run_id == run_id).cloned().collect();
        rows.sort_by_key(|r| r.row_index);
        Ok(rows)
    }

    fn get_token(&self, token_id: &str) -> Result<TokenRecord, StoreError> {
        self.tokens
            .iter()
            .find(|t| t.token_id == token_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("token {token_id}")))
    }

    fn list_tokens_for_row(&self, row_id: &str) -> Result<Vec<TokenRecord>, StoreError> {
        Ok(self.tokens.iter().filter(|t| t.row_id == row_id).cloned().collect())
    }

    fn list_tokens_for_run(&self, run_id: &str) -> Result<Vec<TokenRecord>, StoreError> {
        let row_ids: Vec<&str> = self.rows
                                     .iter()
                                     .filter(|r| r.run_id == run_id)
                                     .map(|r| r.row_id.as_str())
                                     .collect();
        Ok(self.tokens
               .iter()
               .filter(|t| row_ids.contains(&t.row_id.as_str()))
               .cloned()
               .collect())
    }

    fn get_token_outcome(&self, token_id: &str)
                         -> Result<Option<TokenOutcomeRecord>, StoreError> {
        Ok(self.token_outcomes.get(token_id).cloned())
    }

    fn list_node_states_for_token(&self, token_id: &str)
                                  -> Result<Vec<NodeStateRecord>, StoreError> {
        let mut states: Vec<NodeStateRecord> = self.node_states
                                                   .iter()
                                                   .filter(|s| s.token_id == token_id)
                                                   .cloned()
                                                   .collect();
        states.sort_by_key(|s| (s.step_index, s.attempt));
        Ok(states)
    }

    fn get_node_state(&self, state_id: &str) -> Result<NodeStateRecord, StoreError> {
        self.node_states
            .iter()
            .find(|s| s.state_id == state_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("node_state {state_id}")))
    }

    fn list_routing_events(&self, state_id: &str)
                           -> Result<Vec<RoutingEventRecord>, StoreError> {
        Ok(self.routing_events
               .iter()
               .filter(|e| e.state_id == state_id)
               .cloned()
               .collect())
    }

    fn get_batch(&self, batch_id: &str) -> Result<BatchRecord, StoreError> {
        self.batches
            .iter()
            .find(|b| b.batch_id == batch_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("batch {batch_id}")))
    }

    fn list_batch_members(&self, batch_id: &str)
                          -> Result<Vec<BatchMemberRecord>, StoreError> {
        let mut members: Vec<BatchMemberRecord> = self.batch_members
                                                      .iter()
                                                      .filter(|m| m.batch_id == batch_id)
                                                      .cloned()
                                                      .collect();
        members.sort_by_key(|m| m.ordinal);
        Ok(members)
    }

    fn list_artifacts(&self, run_id: &str) -> Result<Vec<ArtifactRecord>, StoreError> {
        Ok(self.artifacts.iter().filter(|a| a.run_id == run_id).cloned().collect())
    }

    fn list_transform_errors_for_token(&self, token_id: &str)
                                       -> Result<Vec<TransformErrorRecord>, StoreError> {
        Ok(self.transform_errors
               .iter()
               .filter(|e| e.token_id == token_id)
               .cloned()
               .collect())
    }

    fn list_token_parents(&self, token_id: &str)
                          -> Result<Vec<TokenParentRecord>, StoreError> {
        let mut parents: Vec<TokenParentRecord> = self.token_parents
                                                      .iter()
                                                      .filter(|p| p.token_id == token_id)
                                                      .cloned()
                                                      .collect();
        parents.sort_by_key(|p| p.ordinal);
        Ok(parents)
    }
}

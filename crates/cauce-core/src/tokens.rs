//! Identidades de token y su gestor.
//!
//! Un token es la identidad trazable de una fila en un punto del DAG. El
//! TokenManager crea tokens (admisión, fork, coalesce, expand) y registra la
//! genealogía en el ledger; los group ids que devuelve son los MISMOS que
//! luego se escriben en los outcomes terminales (la consistencia entre la
//! tabla de tokens y la de outcomes es un invariante).

use serde_json::Value;
use uuid::Uuid;

use crate::contracts::{NodeId, RunId};
use crate::errors::EngineError;
use crate::recorder::{AuditStore, Recorder};

/// Vista en memoria de un token mientras transita el pipeline. La verdad
/// durable vive en el ledger; esto es el estado de trabajo.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub token_id: String,
    pub row_id: String,
    pub row_data: Value,
    pub branch_name: Option<String>,
    pub fork_group_id: Option<String>,
    pub join_group_id: Option<String>,
    pub expand_group_id: Option<String>,
}

impl TokenInfo {
    pub fn new(token_id: impl Into<String>, row_id: impl Into<String>, row_data: Value) -> Self {
        Self { token_id: token_id.into(),
               row_id: row_id.into(),
               row_data,
               branch_name: None,
               fork_group_id: None,
               join_group_id: None,
               expand_group_id: None }
    }

    /// Mismo token, datos nuevos (transform passthrough de identidad).
    pub fn with_data(&self, row_data: Value) -> Self {
        Self { row_data, ..self.clone() }
    }
}

pub struct TokenManager<'a, S: AuditStore> {
    recorder: &'a Recorder<S>,
}

fn new_group_id() -> String {
    Uuid::new_v4().to_string()
}

impl<'a, S: AuditStore> TokenManager<'a, S> {
    pub fn new(recorder: &'a Recorder<S>) -> Self {
        Self { recorder }
    }

    /// Admisión: crea la fila y su token inicial juntos.
    pub fn create_initial_token(&self,
                                run_id: &RunId,
                                source_node_id: &NodeId,
                                row_index: usize,
                                row_data: Value)
                                -> Result<TokenInfo, EngineError> {
        let row = self.recorder
                      .create_row(run_id, source_node_id, row_index, row_data.clone(), None)?;
        let token = self.recorder
                        .create_token(&row.row_id, None, None, None, None, None, &[])?;
        Ok(TokenInfo::new(token.token_id, row.row_id, row_data))
    }

    /// Fork: un hijo por rama, todos con el row_id del padre y un
    /// fork_group_id compartido. El outcome FORKED del padre (que escribe el
    /// procesador) usa este mismo id.
    pub fn fork_token(&self,
                      parent: &TokenInfo,
                      branches: &[String])
                      -> Result<(Vec<TokenInfo>, String), EngineError> {
        let fork_group_id = new_group_id();
        let mut children = Vec::with_capacity(branches.len());
        for branch in branches {
            let record = self.recorder.create_token(&parent.row_id,
                                                    None,
                                                    Some(branch.clone()),
                                                    Some(fork_group_id.clone()),
                                                    None,
                                                    None,
                                                    &[parent.token_id.clone()])?;
            let mut child = TokenInfo::new(record.token_id,
                                           parent.row_id.clone(),
                                           parent.row_data.clone());
            child.branch_name = Some(branch.clone());
            child.fork_group_id = Some(fork_group_id.clone());
            children.push(child);
        }
        Ok((children, fork_group_id))
    }

    /// Coalesce: token fusionado con parent links a TODOS los consumidos y
    /// un join_group_id compartido con sus outcomes COALESCED.
    pub fn coalesce_tokens(&self,
                           parents: &[TokenInfo],
                           merged_data: Value)
                           -> Result<(TokenInfo, String), EngineError> {
        let join_group_id = new_group_id();
        let row_id = parents
            .first()
            .map(|p| p.row_id.clone())
            .ok_or_else(|| EngineError::InvariantViolation(
                "coalesce over an empty parent set".to_string(),
            ))?;
        let parent_ids: Vec<String> = parents.iter().map(|p| p.token_id.clone()).collect();
        let record = self.recorder.create_token(&row_id,
                                                None,
                                                None,
                                                None,
                                                Some(join_group_id.clone()),
                                                None,
                                                &parent_ids)?;
        let mut merged = TokenInfo::new(record.token_id, row_id, merged_data);
        merged.join_group_id = Some(join_group_id.clone());
        Ok((merged, join_group_id))
    }

    /// Expand (deaggregación): hijos nuevos compartiendo expand_group_id.
    /// El padre recibirá EXPANDED con este mismo id.
    pub fn expand_token(&self,
                        parent: &TokenInfo,
                        outputs: &[Value])
                        -> Result<(Vec<TokenInfo>, String), EngineError> {
        let expand_group_id = new_group_id();
        let mut children = Vec::with_capacity(outputs.len());
        for output in outputs {
            let record = self.recorder.create_token(&parent.row_id,
                                                    None,
                                                    parent.branch_name.clone(),
                                                    None,
                                                    None,
                                                    Some(expand_group_id.clone()),
                                                    &[parent.token_id.clone()])?;
            let mut child = TokenInfo::new(record.token_id,
                                           parent.row_id.clone(),
                                           output.clone());
            child.branch_name = parent.branch_name.clone();
            child.expand_group_id = Some(expand_group_id.clone());
            children.push(child);
        }
        Ok((children, expand_group_id))
    }

    /// Token nuevo para la salida de un batch en modo transform: identidad
    /// nueva, fila ancla compartida con el primer input.
    pub fn create_batch_output_token(&self,
                                     anchor_row_id: &str,
                                     row_data: Value)
                                     -> Result<TokenInfo, EngineError> {
        let record = self.recorder
                         .create_token(anchor_row_id, None, None, None, None, None, &[])?;
        Ok(TokenInfo::new(record.token_id, anchor_row_id.to_string(), row_data))
    }
}

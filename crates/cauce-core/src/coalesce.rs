//! Executor de coalesce: junta ramas de un fork en un token único.
//!
//! Acepta tokens por nombre de coalesce, agrupados por el row_id compartido
//! del fork. Políticas: require_all, best_effort (timeout), quorum, first.
//! En el merge escribe los COALESCED de todos los consumidos (join_group_id
//! compartido) y devuelve el token fusionado; los fallos (llegada tardía,
//! rama seleccionada ausente, timeout sin llegadas) vuelven como razón y es
//! el procesador quien escribe EL outcome del token afectado, nunca dos.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::clock::Clock;
use crate::contracts::{
    CoalesceName, CoalescePolicy, CoalesceSettings, MergeStrategy, NodeId, NodeStateStatus,
    RowOutcome,
};
use crate::errors::EngineError;
use crate::recorder::{AuditStore, OutcomeDetail, Recorder};
use crate::spans::SpanFactory;
use crate::tokens::{TokenInfo, TokenManager};

/// Desenlace de una llegada (o de un barrido de timeouts).
#[derive(Debug)]
pub struct CoalesceOutcome {
    /// El token quedó retenido esperando más ramas.
    pub held: bool,
    pub merged_token: Option<TokenInfo>,
    /// Tokens consumidos por este desenlace (los mergeados, o el tardío).
    pub consumed_tokens: Vec<TokenInfo>,
    /// Razón de falla (`late_arrival_after_merge`, `selected_branch_missing`,
    /// `timeout_no_arrivals`). None en merges exitosos.
    pub failure_reason: Option<String>,
    /// Metadata auditable del merge: policy, branches_arrived,
    /// expected_branches, arrival_order.
    pub metadata: Option<Value>,
}

impl CoalesceOutcome {
    fn held() -> Self {
        Self { held: true,
               merged_token: None,
               consumed_tokens: Vec::new(),
               failure_reason: None,
               metadata: None }
    }
}

struct Arrival {
    branch: String,
    token: TokenInfo,
}

struct PendingGroup {
    arrivals: Vec<Arrival>,
    first_arrival_at: f64,
}

pub struct CoalesceExecutor<'a, S: AuditStore> {
    recorder: &'a Recorder<S>,
    spans: &'a SpanFactory,
    token_manager: TokenManager<'a, S>,
    clock: Arc<dyn Clock>,
    registered: HashMap<CoalesceName, (CoalesceSettings, NodeId)>,
    branch_to_coalesce: HashMap<String, CoalesceName>,
    pending: HashMap<(CoalesceName, String), PendingGroup>,
    merged: HashSet<(CoalesceName, String)>,
}

impl<'a, S: AuditStore> CoalesceExecutor<'a, S> {
    pub fn new(recorder: &'a Recorder<S>,
               spans: &'a SpanFactory,
               token_manager: TokenManager<'a, S>,
               clock: Arc<dyn Clock>)
               -> Self {
        Self { recorder,
               spans,
               token_manager,
               clock,
               registered: HashMap::new(),
               branch_to_coalesce: HashMap::new(),
               pending: HashMap::new(),
               merged: HashSet::new() }
    }

    pub fn register_coalesce(&mut self, settings: CoalesceSettings, node_id: impl Into<String>) {
        for branch in &settings.branches {
            self.branch_to_coalesce.insert(branch.clone(), settings.name.clone());
        }
        self.registered.insert(settings.name.clone(), (settings, node_id.into()));
    }

    /// Nombre del coalesce al que aporta una rama, si hay uno registrado.
    pub fn coalesce_for_branch(&self, branch: &str) -> Option<&str> {
        self.branch_to_coalesce.get(branch).map(String::as_str)
    }

    pub fn registered_names(&self) -> Vec<String> {
        self.registered.keys().cloned().collect()
    }

    /// Acepta la llegada de un token a un punto de coalesce.
    pub fn accept(&mut self,
                  token: TokenInfo,
                  name: &str,
                  step_in_pipeline: usize)
                  -> Result<CoalesceOutcome, EngineError> {
        let (settings, _) = self.registered
                                .get(name)
                                .ok_or_else(|| EngineError::ContractViolation(format!(
                                    "coalesce {name:?} is not registered"
                                )))?
                                .clone();

        let key = (name.to_string(), token.row_id.clone());

        if self.merged.contains(&key) {
            // El grupo ya mergeó: llegada tardía. El procesador escribe el
            // FAILED; acá sólo se clasifica.
            log::debug!("late arrival at coalesce {name}: token {}", token.token_id);
            return Ok(CoalesceOutcome { held: false,
                                        merged_token: None,
                                        consumed_tokens: vec![token],
                                        failure_reason: Some(
                                            "late_arrival_after_merge".to_string(),
                                        ),
                                        metadata: None });
        }

        let branch = token.branch_name.clone().unwrap_or_default();
        let now = self.clock.now();
        let group = self.pending
                        .entry(key.clone())
                        .or_insert_with(|| PendingGroup { arrivals: Vec::new(),
                                                          first_arrival_at: now });
        group.arrivals.push(Arrival { branch, token });

        let arrived = group.arrivals.len();
        let expected = settings.branches.len();
        let should_merge = match settings.policy {
            CoalescePolicy::RequireAll => arrived >= expected,
            CoalescePolicy::Quorum => arrived >= settings.quorum_count.unwrap_or(expected),
            CoalescePolicy::First => arrived >= 1,
            // best_effort también mergea temprano si ya está completo.
            CoalescePolicy::BestEffort => arrived >= expected,
        };

        if should_merge {
            self.merge_group(name, &key, &settings, step_in_pipeline)
        } else {
            Ok(CoalesceOutcome::held())
        }
    }

    /// Barrido de timeouts para un coalesce best_effort. Devuelve un
    /// desenlace por grupo vencido.
    pub fn check_timeouts(&mut self,
                          name: &str,
                          step_in_pipeline: usize)
                          -> Result<Vec<CoalesceOutcome>, EngineError> {
        let (settings, _) = match self.registered.get(name) {
            Some(entry) => entry.clone(),
            None => return Ok(Vec::new()),
        };
        let Some(timeout) = settings.timeout_seconds else {
            return Ok(Vec::new());
        };
        if settings.policy != CoalescePolicy::BestEffort {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let expired: Vec<(CoalesceName, String)> =
            self.pending
                .iter()
                .filter(|((n, _), group)| n == name && now - group.first_arrival_at >= timeout)
                .map(|(key, _)| key.clone())
                .collect();

        let mut outcomes = Vec::with_capacity(expired.len());
        for key in expired {
            outcomes.push(self.merge_group(name, &key, &settings, step_in_pipeline)?);
        }
        Ok(outcomes)
    }

    fn merge_group(&mut self,
                   name: &str,
                   key: &(CoalesceName, String),
                   settings: &CoalesceSettings,
                   step_in_pipeline: usize)
                   -> Result<CoalesceOutcome, EngineError> {
        let group = match self.pending.remove(key) {
            Some(group) => group,
            None => {
                return Ok(CoalesceOutcome { held: false,
                                            merged_token: None,
                                            consumed_tokens: Vec::new(),
                                            failure_reason: Some(
                                                "timeout_no_arrivals".to_string(),
                                            ),
                                            metadata: None });
            }
        };
        self.merged.insert(key.clone());

        let _span = self.spans.start(format!("coalesce:{name}"));

        let branches_arrived: Vec<String> =
            group.arrivals.iter().map(|a| a.branch.clone()).collect();

        // "select": la rama elegida debe haber llegado.
        if settings.merge == MergeStrategy::Select {
            let wanted = settings.select_branch
                                 .clone()
                                 .or_else(|| settings.primary_branch.clone())
                                 .unwrap_or_default();
            if !branches_arrived.iter().any(|b| *b == wanted) {
                let consumed: Vec<TokenInfo> =
                    group.arrivals.into_iter().map(|a| a.token).collect();
                return Ok(CoalesceOutcome { held: false,
                                            merged_token: None,
                                            consumed_tokens: consumed,
                                            failure_reason: Some(
                                                "selected_branch_missing".to_string(),
                                            ),
                                            metadata: None });
            }
        }

        let merged_data = merge_rows(settings, &group.arrivals);
        let inputs: Vec<TokenInfo> = group.arrivals.iter().map(|a| a.token.clone()).collect();
        let (merged_token, join_group_id) =
            self.token_manager.coalesce_tokens(&inputs, merged_data)?;

        // node_state del merge, anclado al token fusionado en el nodo del
        // coalesce.
        let (_, node_id) = self.registered.get(name).expect("registered checked above");
        let input_value = Value::Array(inputs.iter().map(|t| t.row_data.clone()).collect());
        let state = self.recorder.begin_node_state(&merged_token.token_id,
                                                   node_id,
                                                   step_in_pipeline,
                                                   0,
                                                   &input_value)?;
        self.recorder.complete_node_state(&state.state_id,
                                          NodeStateStatus::Completed,
                                          Some(&merged_token.row_data),
                                          Some(0),
                                          None,
                                          None)?;

        // COALESCED para todos los consumidos, con el join group compartido.
        for input in &inputs {
            self.recorder.record_terminal_outcome(&input.token_id,
                                                  RowOutcome::Coalesced,
                                                  OutcomeDetail::join_group(
                                                      join_group_id.clone(),
                                                  ))?;
        }

        let arrival_order: Vec<Value> = group.arrivals
                                             .iter()
                                             .map(|a| json!({
                                                 "branch": a.branch,
                                                 "token_id": a.token.token_id,
                                             }))
                                             .collect();
        let metadata = json!({
            "policy": settings.policy.as_str(),
            "branches_arrived": branches_arrived,
            "expected_branches": settings.branches,
            "arrival_order": arrival_order,
        });

        Ok(CoalesceOutcome { held: false,
                             merged_token: Some(merged_token),
                             consumed_tokens: inputs,
                             failure_reason: None,
                             metadata: Some(metadata) })
    }
}

/// Aplica la estrategia de merge sobre las llegadas, en orden de llegada.
fn merge_rows(settings: &CoalesceSettings, arrivals: &[Arrival]) -> Value {
    match settings.merge {
        MergeStrategy::Union => {
            let mut out = Map::new();
            for arrival in arrivals {
                if let Value::Object(fields) = &arrival.token.row_data {
                    for (k, v) in fields {
                        out.insert(k.clone(), v.clone());
                    }
                }
            }
            Value::Object(out)
        }
        MergeStrategy::Nested => {
            let mut out = Map::new();
            for arrival in arrivals {
                out.insert(arrival.branch.clone(), arrival.token.row_data.clone());
            }
            Value::Object(out)
        }
        MergeStrategy::PreferPrimary => {
            let primary = settings.primary_branch.clone().unwrap_or_default();
            let mut out = Map::new();
            for arrival in arrivals.iter().filter(|a| a.branch != primary) {
                if let Value::Object(fields) = &arrival.token.row_data {
                    for (k, v) in fields {
                        out.insert(k.clone(), v.clone());
                    }
                }
            }
            // La primaria pisa al final.
            for arrival in arrivals.iter().filter(|a| a.branch == primary) {
                if let Value::Object(fields) = &arrival.token.row_data {
                    for (k, v) in fields {
                        out.insert(k.clone(), v.clone());
                    }
                }
            }
            Value::Object(out)
        }
        MergeStrategy::Select => {
            let wanted = settings.select_branch
                                 .clone()
                                 .or_else(|| settings.primary_branch.clone())
                                 .unwrap_or_default();
            arrivals.iter()
                    .find(|a| a.branch == wanted)
                    .map(|a| a.token.row_data.clone())
                    .unwrap_or(Value::Null)
        }
    }
}

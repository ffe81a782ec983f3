// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Statement execution on behalf of a flow.

use tracing::{debug, warn};

use super::{DbQuery, FlowMachineContext};
use crate::engine::{sql_text, QueryResult, StatementKind};
use crate::flow::{FlowContext, FlowError};

impl FlowMachineContext {
    /// Run `query` against the engine.
    ///
    /// When a write changes rows and the query carries a change id, the
    /// change record is written explicitly (it coexists with the triggers'
    /// records) and every flow named in `notify` is woken.
    pub async fn call_db_query(
        &self,
        flow: &FlowContext,
        query: DbQuery,
        notify: &[&str],
    ) -> Result<QueryResult, FlowError> {
        let (kind, _) = sql_text::classify(&query.sql);
        let result = self
            .engine
            .query_with_bindings(&query.sql, &query.bindings)
            .await
            .map_err(|e| {
                warn!(flow = %flow.name(), operation = %kind, error = %e, "Query failed");
                FlowError::from(e)
            })?;

        let is_write = matches!(kind, StatementKind::Insert | StatementKind::Update | StatementKind::Delete);
        if !is_write || !result.is_ok_result() {
            return Ok(result);
        }

        if let Some(change_id) = &query.change_id {
            let change_table = flow.definition().change_table();
            if let Err(e) = self
                .engine
                .query_with_bindings(&change_table.insert_sql(), &change_id.bindings())
                .await
            {
                warn!(flow = %flow.name(), change = %change_id, error = %e, "Could not record change");
            }
        }

        for name in notify {
            match self.get_flow_context(name) {
                Some(target) => target.notify_changed(),
                None => debug!(flow = %name, "No flow to notify"),
            }
        }
        Ok(result)
    }
}

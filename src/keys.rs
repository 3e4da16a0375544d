// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Console access-key staging for mountain-class hardware.
//!
//! Staging is an opaque, all-or-nothing batch operation performed by an
//! external program that is handed the affected node ids. The reconciler
//! only cares about the success bit: on failure it latches a full key
//! resweep for the next tick.

use crate::inventory::NodeRecord;
use async_trait::async_trait;
use camino::Utf8PathBuf;
use slog::{info, o, warn, Logger};
use slog_error_chain::InlineErrorChain;

#[async_trait]
pub trait KeyStager: Send + Sync {
    /// Ensure console access keys are staged for every listed node.
    async fn stage(&self, nodes: &[NodeRecord]) -> bool;
}

pub struct ScriptKeyStager {
    program: Utf8PathBuf,
    log: Logger,
}

impl ScriptKeyStager {
    pub fn new(program: Utf8PathBuf, log: &Logger) -> Self {
        Self { program, log: log.new(o!("component" => "key-stager")) }
    }
}

#[async_trait]
impl KeyStager for ScriptKeyStager {
    async fn stage(&self, nodes: &[NodeRecord]) -> bool {
        info!(
            self.log, "staging console keys";
            "count" => nodes.len(),
        );
        let status = tokio::process::Command::new(self.program.as_std_path())
            .args(nodes.iter().map(|n| n.node_id.as_str()))
            .status()
            .await;
        match status {
            Ok(status) if status.success() => true,
            Ok(status) => {
                warn!(
                    self.log, "key staging program failed";
                    "status" => %status,
                );
                false
            }
            Err(err) => {
                warn!(
                    self.log, "unable to run key staging program";
                    "program" => self.program.as_str(),
                    InlineErrorChain::new(&err),
                );
                false
            }
        }
    }
}

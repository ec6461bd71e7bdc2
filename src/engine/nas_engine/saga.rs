// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A generic runner for ordered multi-resource operations with
//! compensating rollback. Steps run strictly in order; when step *k*
//! fails, the runner reverts steps *k-1..1* in reverse order, logging
//! but not failing on revert errors, and surfaces step *k*'s error.
//!
//! The runner never retries a step. The orchestrator's retry of the
//! whole operation is the retry mechanism, which is why each step must
//! itself be idempotent: a re-run must detect and reuse whatever its
//! earlier invocation left behind.

use async_trait::async_trait;
use log::{debug, warn};

use crate::znas::ZnasResult;

/// One step of a saga: an action over a shared context, paired with
/// the compensating action that undoes it.
#[async_trait]
pub trait SagaStep<C: Send>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, cx: &mut C) -> ZnasResult<()>;

    /// Undo the effects of a completed `apply`. Called only during
    /// rollback; errors are logged by the runner and otherwise ignored.
    async fn revert(&self, cx: &mut C) -> ZnasResult<()>;
}

/// Run the steps in order, rolling back on the first failure.
pub async fn run_saga<C: Send>(steps: &[Box<dyn SagaStep<C>>], cx: &mut C) -> ZnasResult<()> {
    for (idx, step) in steps.iter().enumerate() {
        debug!("saga step {}: {}", idx + 1, step.name());
        if let Err(err) = step.apply(cx).await {
            warn!(
                "saga step {} failed ({err}); reverting {} completed steps",
                step.name(),
                idx
            );
            for done in steps[..idx].iter().rev() {
                if let Err(revert_err) = done.revert(cx).await {
                    warn!(
                        "revert of saga step {} failed: {revert_err}",
                        done.name()
                    );
                }
            }
            return Err(err);
        }
    }
    Ok(())
}

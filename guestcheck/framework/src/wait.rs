// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Polling helpers for conditions that become true eventually.

use std::{future::Future, time::Duration};

use anyhow::Result;

enum Probe {
    Pending,
    Failed(anyhow::Error),
}

/// Calls `probe` every `step` until it returns `Ok(Some(_))` or `timeout`
/// has elapsed.
///
/// `Ok(None)` from the probe means "not yet". An error stops polling and is
/// returned to the caller. Running out of time is not an error: the result
/// is `Ok(None)` and the caller decides what that means.
pub async fn wait_for<T, F, Fut>(
    timeout: Duration,
    step: Duration,
    mut probe: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let backoff = backoff::ExponentialBackoff {
        initial_interval: step,
        current_interval: step,
        max_interval: step,
        multiplier: 1.0,
        randomization_factor: 0.0,
        max_elapsed_time: Some(timeout),
        ..Default::default()
    };

    let res = backoff::future::retry(backoff, || {
        let attempt = probe();
        async move {
            match attempt.await {
                Ok(Some(v)) => Ok(v),
                Ok(None) => Err(backoff::Error::transient(Probe::Pending)),
                Err(e) => Err(backoff::Error::permanent(Probe::Failed(e))),
            }
        }
    })
    .await;

    match res {
        Ok(v) => Ok(Some(v)),
        Err(Probe::Pending) => Ok(None),
        Err(Probe::Failed(e)) => Err(e),
    }
}

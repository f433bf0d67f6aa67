// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Unix signal processing

use log::{debug, warn};
use std::sync::{Arc, Weak};
use tokio::signal::unix::{signal, SignalKind};

use crate::AccessContext;

fn listen_to_signal(kind: SignalKind, context: Weak<AccessContext>) {
    tokio::spawn(async move {
        let mut sig = match signal(kind) {
            Ok(sig) => sig,
            Err(err) => {
                warn!(
                    "Failed registering for signal {}: {err}",
                    kind.as_raw_value()
                );
                return;
            }
        };

        while sig.recv().await.is_some() {
            let Some(context) = context.upgrade() else {
                break;
            };
            debug!(
                "Received signal {}, reopening files of {context}",
                kind.as_raw_value()
            );
            context.reopen();
        }
    });
}

/// Reopens the files of the access log on `SIGHUP` and `SIGUSR1`
///
/// This has to be called within a tokio runtime. Listening stops once the context is dropped.
pub fn listen(context: &Arc<AccessContext>) {
    listen_to_signal(SignalKind::hangup(), Arc::downgrade(context));
    listen_to_signal(SignalKind::user_defined1(), Arc::downgrade(context));
}

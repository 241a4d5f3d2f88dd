//
// Copyright (c) The Helix Core Contributors
//
// SPDX-License-Identifier: MIT
//

use helix_utils::UnboundedReceiver;
use helix_utils::southbound::SwitchMsg;
use helix_utils::task::Task;
use tracing::debug;

/// Drains one instance's switch programs towards the OpenFlow adapter.
///
/// The wire encoder is an external collaborator; this sink is its
/// attachment point and traces the outgoing programs until one is
/// connected.
pub(crate) fn spawn_sink(
    name: String,
    mut rx: UnboundedReceiver<SwitchMsg>,
) -> Task<()> {
    Task::spawn(async move {
        while let Some(msg) = rx.recv().await {
            debug!(instance = %name, ?msg, "southbound");
        }
    })
}

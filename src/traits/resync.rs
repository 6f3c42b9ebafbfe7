// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::group::ResyncRequest;

/// Callback of the group collaborator, invoked when too many group messages are waiting for
/// missing epochs or have been waiting for too long.
///
/// Implementations are expected to fetch the missing commits or epoch updates out of band and
/// report them back through `set_epoch`. The callback is invoked while holding the group's lock
/// and must not block.
pub trait Resync<ID> {
    fn resync(&self, group_id: &ID, request: ResyncRequest);
}

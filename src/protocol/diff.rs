//! C6: structure-phase diffing.
//!
//! Given a local `(handle -> mtime)` view and a remote structure list, this
//! produces the operations needed to converge the two replicas, per
//! spec.md §4.2.

use crate::handle::Handle;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOp {
	/// Ask the peer for the file identified by `handle`.
	Request(Handle),
	/// Begin sending our local copy of `handle` to the peer.
	Send(Handle),
	/// Tell the peer to delete `handle` at `mtime` (reconfirm a deletion the
	/// peer doesn't know about yet).
	DeleteOnPeer { handle: Handle, mtime: u32 },
}

/// Compute the operations a receiver of `remote` should enqueue, given its
/// own `local` map and a predicate for PDIL(Deleted) membership.
///
/// Tie-break: identical mtimes are treated as equal (no-op), matching
/// spec.md §9's resolution of the "identical mtime, different content" open
/// question.
pub fn diff_structures(
	local: &HashMap<Handle, u32>,
	remote: &[(Handle, u32)],
	is_deleted_locally: impl Fn(Handle) -> bool,
) -> Vec<DiffOp> {
	let mut ops = Vec::new();
	let mut remote_handles = HashSet::with_capacity(remote.len());

	for &(handle, remote_mtime) in remote {
		remote_handles.insert(handle);
		match local.get(&handle) {
			Some(&local_mtime) => {
				if remote_mtime > local_mtime {
					ops.push(DiffOp::Request(handle));
				} else if remote_mtime < local_mtime {
					ops.push(DiffOp::Send(handle));
				}
			}
			None => {
				if is_deleted_locally(handle) {
					ops.push(DiffOp::DeleteOnPeer { handle, mtime: remote_mtime });
				} else {
					ops.push(DiffOp::Request(handle));
				}
			}
		}
	}

	for &handle in local.keys() {
		if !remote_handles.contains(&handle) {
			ops.push(DiffOp::Send(handle));
		}
	}

	ops
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::handle::EntryKind;

	fn h(name: &str) -> Handle {
		Handle::derive(name, EntryKind::File)
	}

	#[test]
	fn remote_newer_requests_it() {
		let mut local = HashMap::new();
		local.insert(h("a.txt"), 100);
		let remote = vec![(h("a.txt"), 200)];
		let ops = diff_structures(&local, &remote, |_| false);
		assert_eq!(ops, vec![DiffOp::Request(h("a.txt"))]);
	}

	#[test]
	fn local_newer_sends_it() {
		let mut local = HashMap::new();
		local.insert(h("a.txt"), 200);
		let remote = vec![(h("a.txt"), 100)];
		let ops = diff_structures(&local, &remote, |_| false);
		assert_eq!(ops, vec![DiffOp::Send(h("a.txt"))]);
	}

	#[test]
	fn equal_mtimes_are_a_noop() {
		let mut local = HashMap::new();
		local.insert(h("a.txt"), 100);
		let remote = vec![(h("a.txt"), 100)];
		let ops = diff_structures(&local, &remote, |_| false);
		assert!(ops.is_empty());
	}

	#[test]
	fn unknown_remote_handle_not_deleted_locally_is_requested() {
		let local = HashMap::new();
		let remote = vec![(h("new.txt"), 100)];
		let ops = diff_structures(&local, &remote, |_| false);
		assert_eq!(ops, vec![DiffOp::Request(h("new.txt"))]);
	}

	#[test]
	fn unknown_remote_handle_deleted_locally_reconfirms_delete() {
		let local = HashMap::new();
		let remote = vec![(h("gone.txt"), 100)];
		let ops = diff_structures(&local, &remote, |_| true);
		assert_eq!(ops, vec![DiffOp::DeleteOnPeer { handle: h("gone.txt"), mtime: 100 }]);
	}

	#[test]
	fn local_only_handle_is_sent() {
		let mut local = HashMap::new();
		local.insert(h("only_local.txt"), 50);
		let remote = vec![];
		let ops = diff_structures(&local, &remote, |_| false);
		assert_eq!(ops, vec![DiffOp::Send(h("only_local.txt"))]);
	}

	#[test]
	fn concurrent_edit_scenario_matches_spec_example() {
		// client mtime=1700000100, server mtime=1700000050: server should
		// request from client.
		let mut server_local = HashMap::new();
		server_local.insert(h("a.txt"), 1700000050);
		let client_remote = vec![(h("a.txt"), 1700000100)];
		let ops = diff_structures(&server_local, &client_remote, |_| false);
		assert_eq!(ops, vec![DiffOp::Request(h("a.txt"))]);
	}
}

// vim: ts=4

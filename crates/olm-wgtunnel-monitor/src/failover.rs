// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Path selection policy, kept as pure functions so every transition is
//! table-testable.

/// Consecutive probe failures before a primary path is declared unreachable.
pub const FAILURE_THRESHOLD: u32 = 3;

/// Which path a site is currently using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
	/// No probe has succeeded yet.
	Unknown,
	/// Direct path to the site's own endpoint.
	Primary,
	/// Primary failed; waiting for a relay directive.
	Unreachable,
	/// Traffic pinned to a relay endpoint by the control plane.
	Relay,
}

/// State after a successful probe of the path currently in use.
pub fn after_success(current: Selection) -> Selection {
	match current {
		Selection::Unknown | Selection::Unreachable => Selection::Primary,
		Selection::Primary => Selection::Primary,
		Selection::Relay => Selection::Relay,
	}
}

/// State after a failed probe, given the failure count including this one.
pub fn after_failure(current: Selection, consecutive_failures: u32) -> Selection {
	match current {
		Selection::Primary if consecutive_failures >= FAILURE_THRESHOLD => Selection::Unreachable,
		other => other,
	}
}

/// Whether this failure is the one crossing the unreachable threshold, which
/// is the moment a disconnect is reported.
pub fn crossed_threshold(consecutive_failures: u32) -> bool {
	consecutive_failures == FAILURE_THRESHOLD
}

/// A relay-pinned site keeps probing its primary endpoint and snaps back as
/// soon as it answers.
pub fn should_probe_primary(current: Selection) -> bool {
	current == Selection::Relay
}

#[cfg(test)]
mod tests {
	use super::*;
	use Selection::*;

	#[test]
	fn success_transitions() {
		let cases = [
			(Unknown, Primary),
			(Primary, Primary),
			(Unreachable, Primary),
			(Relay, Relay),
		];
		for (from, to) in cases {
			assert_eq!(after_success(from), to, "from {from:?}");
		}
	}

	#[test]
	fn failure_transitions_below_threshold() {
		for failures in 1..FAILURE_THRESHOLD {
			assert_eq!(after_failure(Primary, failures), Primary);
		}
	}

	#[test]
	fn failure_transitions_at_threshold() {
		assert_eq!(after_failure(Primary, FAILURE_THRESHOLD), Unreachable);
		assert_eq!(after_failure(Primary, FAILURE_THRESHOLD + 2), Unreachable);
	}

	#[test]
	fn failures_do_not_move_other_states() {
		for state in [Unknown, Unreachable, Relay] {
			assert_eq!(after_failure(state, FAILURE_THRESHOLD), state);
		}
	}

	#[test]
	fn threshold_crossing_fires_once() {
		assert!(!crossed_threshold(FAILURE_THRESHOLD - 1));
		assert!(crossed_threshold(FAILURE_THRESHOLD));
		assert!(!crossed_threshold(FAILURE_THRESHOLD + 1));
	}

	#[test]
	fn only_relay_probes_primary() {
		assert!(should_probe_primary(Relay));
		assert!(!should_probe_primary(Primary));
		assert!(!should_probe_primary(Unknown));
		assert!(!should_probe_primary(Unreachable));
	}
}

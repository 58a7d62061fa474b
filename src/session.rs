//! C8: Session & Role Manager.
//!
//! PIN challenge/response login, per-peer session state, and brute-force
//! rate limiting. PIN issuance and storage are an external collaborator
//! (spec.md §1); this module only consumes them through [`SecretStore`].

use crate::config::Role;
use crate::error::SessionError;
use crate::logging::*;
use rand::RngCore;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// First N-1 failed attempts are tolerated if spaced apart; the Nth within
/// the window triggers a cooldown. Per spec.md §4.3.
const MAX_ATTEMPTS_BEFORE_COOLDOWN: u32 = 3;
const COOLDOWN_DURATION: Duration = Duration::from_secs(600);
const MIN_ATTEMPT_SPACING: Duration = Duration::from_secs(5);
const CHALLENGE_LEN: usize = 16;
const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(60);

/// External boundary for PIN storage: a master PIN and bounded ephemeral
/// PINs, issuance and encrypted persistence are outside this crate's scope.
pub trait SecretStore: Send + Sync {
	/// All PINs currently valid for `peer_user_id` (master plus unexpired
	/// ephemeral ones); expired ephemeral PINs are the store's own concern
	/// to purge lazily on read.
	fn active_pins(&self, peer_user_id: &str) -> Vec<String>;

	/// Called once a PIN has been used successfully, so an ephemeral one can
	/// be removed from the store (master PINs are a no-op here).
	fn consume_pin(&self, peer_user_id: &str, pin: &str);
}

/// Minimal [`SecretStore`]: one master PIN, valid for every peer, never
/// consumed. Ephemeral per-peer PINs are a host-application concern; this
/// covers the single-user "set a PIN in config" deployment.
pub struct MasterPinStore {
	pin: Option<String>,
}

impl MasterPinStore {
	pub fn new(pin: Option<String>) -> Self {
		MasterPinStore { pin }
	}
}

impl SecretStore for MasterPinStore {
	fn active_pins(&self, _peer_user_id: &str) -> Vec<String> {
		self.pin.clone().into_iter().collect()
	}

	fn consume_pin(&self, _peer_user_id: &str, _pin: &str) {}
}

fn xor_with_pin(challenge: &[u8], pin: &str) -> Vec<u8> {
	let pin_bytes = pin.as_bytes();
	challenge.iter().enumerate().map(|(i, b)| b ^ pin_bytes[i % pin_bytes.len()]).collect()
}

fn expected_proof(challenge: &[u8], pin: &str) -> [u8; 32] {
	*blake3::hash(&xor_with_pin(challenge, pin)).as_bytes()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}
	a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug)]
struct PendingChallenge {
	bytes: [u8; CHALLENGE_LEN],
	issued_at: Instant,
}

/// Authentication and rate-limit state for one peer.
#[derive(Debug)]
pub struct SessionRecord {
	pub peer_id: String,
	pub role: Role,
	pub authenticated: bool,
	pending_challenge: Option<PendingChallenge>,
	attempt_count: u32,
	last_attempt: Option<Instant>,
	cooldown_until: Option<Instant>,
}

impl SessionRecord {
	fn new(peer_id: String, role: Role) -> Self {
		SessionRecord {
			peer_id,
			role,
			authenticated: false,
			pending_challenge: None,
			attempt_count: 0,
			last_attempt: None,
			cooldown_until: None,
		}
	}

	fn check_rate_limit(&mut self, now: Instant) -> Result<(), SessionError> {
		if let Some(cooldown_until) = self.cooldown_until {
			if now < cooldown_until {
				return Err(SessionError::CooldownActive {
					remaining_secs: (cooldown_until - now).as_secs(),
				});
			}
			self.cooldown_until = None;
			self.attempt_count = 0;
		}
		Ok(())
	}

	/// Per spec.md §4.3, the first `MAX_ATTEMPTS_BEFORE_COOLDOWN` failures are
	/// tolerated only if spaced at least `MIN_ATTEMPT_SPACING` apart; a
	/// failure arriving sooner than that skips straight to the cooldown
	/// instead of waiting out the full strike count, since that cadence is
	/// not a human re-typing a PIN.
	fn record_failed_attempt(&mut self, now: Instant) {
		let too_fast = self.last_attempt.map(|last| now.duration_since(last) < MIN_ATTEMPT_SPACING).unwrap_or(false);
		self.last_attempt = Some(now);
		self.attempt_count += 1;
		if too_fast || self.attempt_count > MAX_ATTEMPTS_BEFORE_COOLDOWN {
			self.cooldown_until = Some(now + COOLDOWN_DURATION);
		}
	}

	fn record_success(&mut self) {
		self.attempt_count = 0;
		self.cooldown_until = None;
		self.authenticated = true;
		self.pending_challenge = None;
	}
}

/// Owns all per-peer session records; per spec.md §3, each record is
/// shared-read by handlers and exclusively mutated by this manager under a
/// per-session lock (modelled here as one map-wide lock, which is
/// sufficient given sessions are mutated at authentication-event rate, not
/// per chunk).
pub struct SessionManager {
	sessions: Mutex<HashMap<String, SessionRecord>>,
	local_role: Role,
}

impl SessionManager {
	pub fn new(local_role: Role) -> Self {
		SessionManager { sessions: Mutex::new(HashMap::new()), local_role }
	}

	pub async fn is_authenticated(&self, peer_id: &str) -> bool {
		self.sessions.lock().await.get(peer_id).map(|s| s.authenticated).unwrap_or(false)
	}

	/// Server side: issue a random challenge for a login request.
	pub async fn begin_login(&self, peer_id: &str) -> Result<[u8; CHALLENGE_LEN], SessionError> {
		let now = Instant::now();
		let mut sessions = self.sessions.lock().await;
		let record = sessions
			.entry(peer_id.to_string())
			.or_insert_with(|| SessionRecord::new(peer_id.to_string(), self.local_role));
		record.check_rate_limit(now)?;

		let mut bytes = [0u8; CHALLENGE_LEN];
		rand::thread_rng().fill_bytes(&mut bytes);
		record.pending_challenge = Some(PendingChallenge { bytes, issued_at: now });
		Ok(bytes)
	}

	/// Server side: verify a client's proof against every currently active
	/// PIN, in constant time per candidate.
	pub async fn verify_proof(
		&self,
		peer_id: &str,
		proof: &[u8],
		secrets: &dyn SecretStore,
	) -> Result<(), SessionError> {
		let now = Instant::now();
		let mut sessions = self.sessions.lock().await;
		let record = sessions.get_mut(peer_id).ok_or(SessionError::ChallengeExpired)?;
		record.check_rate_limit(now)?;

		let challenge = match &record.pending_challenge {
			Some(c) if now.duration_since(c.issued_at) <= CHALLENGE_TIMEOUT => c.bytes,
			_ => {
				record.pending_challenge = None;
				return Err(SessionError::ChallengeExpired);
			}
		};

		for pin in secrets.active_pins(peer_id) {
			let expected = expected_proof(&challenge, &pin);
			if constant_time_eq(&expected, proof) {
				record.record_success();
				secrets.consume_pin(peer_id, &pin);
				info!(peer_id, "login successful");
				return Ok(());
			}
		}

		record.record_failed_attempt(now);
		Err(SessionError::BadProof)
	}

	/// Client side: compute the proof to send back for a received challenge.
	pub fn compute_proof(challenge: &[u8], pin: &str) -> [u8; 32] {
		expected_proof(challenge, pin)
	}

	/// Client side: accept the peer's `LoginSuccessful` notice at face value.
	/// The client never runs `verify_proof` itself; it trusts the server's
	/// outcome for the login it just initiated.
	pub async fn mark_authenticated(&self, peer_id: &str) {
		let mut sessions = self.sessions.lock().await;
		let record =
			sessions.entry(peer_id.to_string()).or_insert_with(|| SessionRecord::new(peer_id.to_string(), self.local_role));
		record.record_success();
	}

	pub async fn logout(&self, peer_id: &str) {
		if let Some(record) = self.sessions.lock().await.get_mut(peer_id) {
			record.authenticated = false;
		}
	}
}


// vim: ts=4

//! Relay-side session records and lifecycle.
//!
//! A session is the rendezvous credential pair: a short base32 id and a
//! six-digit passcode. Sessions live purely in memory, expire 24 hours
//! after creation or 30 minutes after the last activity, and lock after
//! five failed passcode attempts.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::Rng;

use crate::cryptography;
use crate::{Error, Result};

pub const SESSION_ID_LENGTH: usize = 6;
pub const MAX_FAILED_ATTEMPTS: u32 = 5;
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

// Every validation takes at least this long, correct or not, so timing
// reveals nothing about which check failed.
const VALIDATION_FLOOR: Duration = Duration::from_millis(100);

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Injected time source so expiry and lockout are deterministic under test.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Clone, Debug)]
pub struct Session {
    pub id: String,
    pub passcode: String,
    pub created: Instant,
    pub last_activity: Instant,
    pub failed_attempts: u32,
    pub locked: bool,
    pub shared_path: String,
    pub active: bool,
}

/// Generates a random human-readable session id: base32 of four CSPRNG
/// bytes, padding trimmed, first six characters.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 4];
    cryptography::fill_random(&mut bytes);
    base32_encode(&bytes).chars().take(SESSION_ID_LENGTH).collect()
}

/// Generates a random six-digit passcode rendered as "XXX-XXX".
pub fn generate_passcode() -> String {
    let n: u32 = OsRng.gen_range(0..1_000_000);
    format!("{:03}-{:03}", n / 1000, n % 1000)
}

fn base32_encode(data: &[u8]) -> String {
    let mut out = String::new();
    let mut bits: u32 = 0;
    let mut nbits: u32 = 0;

    for &b in data {
        bits = (bits << 8) | b as u32;
        nbits += 8;
        while nbits >= 5 {
            let idx = ((bits >> (nbits - 5)) & 0x1F) as usize;
            out.push(BASE32_ALPHABET[idx] as char);
            nbits -= 5;
        }
    }
    if nbits > 0 {
        let idx = ((bits << (5 - nbits)) & 0x1F) as usize;
        out.push(BASE32_ALPHABET[idx] as char);
    }
    out
}

/// All active sessions, behind one reader-writer lock. Mutations happen
/// only in create/validate/touch/revoke/sweep; no I/O runs under the lock.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Creates a session with a fresh unique id and passcode.
    pub fn create_session(&self, shared_path: &str) -> Session {
        let mut sessions = self.sessions.write().expect("session lock poisoned");

        // Re-roll on the (unlikely) id collision
        let id = loop {
            let candidate = generate_session_id();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        let now = self.clock.now();
        let session = Session {
            id: id.clone(),
            passcode: generate_passcode(),
            created: now,
            last_activity: now,
            failed_attempts: 0,
            locked: false,
            shared_path: shared_path.to_string(),
            active: true,
        };

        sessions.insert(id, session.clone());
        session
    }

    pub fn lookup(&self, session_id: &str) -> Option<Session> {
        let sessions = self.sessions.read().expect("session lock poisoned");
        sessions.get(session_id).cloned()
    }

    /// Validates a passcode with rate limiting.
    ///
    /// Total running time is padded to at least 100ms. Unknown, expired
    /// and wrong-passcode cases all collapse into the same generic
    /// error; only the locked state is surfaced distinctly. Five wrong
    /// attempts latch the lock; success resets the counter.
    pub async fn validate_passcode(&self, session_id: &str, passcode: &str) -> Result<()> {
        let start = Instant::now();
        let result = self.check_passcode(session_id, passcode);

        let elapsed = start.elapsed();
        if elapsed < VALIDATION_FLOOR {
            tokio::time::sleep(VALIDATION_FLOOR - elapsed).await;
        }

        result
    }

    fn check_passcode(&self, session_id: &str, passcode: &str) -> Result<()> {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        let now = self.clock.now();

        let session = match sessions.get_mut(session_id) {
            Some(s) => s,
            None => return Err(Error::AuthenticationFailed),
        };

        if session.locked {
            return Err(Error::SessionLocked);
        }

        if now.duration_since(session.created) > SESSION_TIMEOUT {
            sessions.remove(session_id);
            return Err(Error::AuthenticationFailed);
        }

        if !cryptography::constant_time_eq(session.passcode.as_bytes(), passcode.as_bytes()) {
            session.failed_attempts += 1;
            if session.failed_attempts >= MAX_FAILED_ATTEMPTS {
                session.locked = true;
                return Err(Error::SessionLocked);
            }
            return Err(Error::AuthenticationFailed);
        }

        session.failed_attempts = 0;
        session.last_activity = now;
        Ok(())
    }

    /// Refreshes the last-activity timestamp.
    pub fn touch(&self, session_id: &str) {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        if let Some(session) = sessions.get_mut(session_id) {
            session.last_activity = self.clock.now();
        }
    }

    /// Marks a session inactive and removes it.
    pub fn revoke(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        match sessions.remove(session_id) {
            Some(_) => Ok(()),
            None => Err(Error::SessionNotFound),
        }
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        let sessions = self.sessions.read().expect("session lock poisoned");
        sessions.values().filter(|s| s.active).cloned().collect()
    }

    /// Removes sessions past the 24h lifetime or idle longer than 30
    /// minutes. Returns how many were dropped. A background task calls
    /// this every five minutes.
    pub fn sweep(&self) -> usize {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        let now = self.clock.now();
        let before = sessions.len();

        sessions.retain(|_, s| {
            now.duration_since(s.created) <= SESSION_TIMEOUT
                && now.duration_since(s.last_activity) <= IDLE_TIMEOUT
        });

        before - sessions.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().expect("session lock poisoned").len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ManualClock {
        now: Mutex<Instant>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                now: Mutex::new(Instant::now()),
            }
        }

        fn advance(&self, d: Duration) {
            *self.now.lock().unwrap() += d;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }
    }

    // ============================================================================
    // Credential Format Tests
    // ============================================================================

    #[test]
    fn test_session_id_format() {
        for _ in 0..100 {
            let id = generate_session_id();
            assert_eq!(id.len(), SESSION_ID_LENGTH);
            assert!(
                id.bytes().all(|b| BASE32_ALPHABET.contains(&b)),
                "id {} contains non-base32 characters",
                id
            );
        }
    }

    #[test]
    fn test_passcode_format() {
        for _ in 0..100 {
            let passcode = generate_passcode();
            assert_eq!(passcode.len(), 7);
            let (head, tail) = passcode.split_at(3);
            assert!(head.chars().all(|c| c.is_ascii_digit()));
            assert_eq!(&tail[..1], "-");
            assert!(tail[1..].chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_base32_known_vector() {
        // RFC 4648: "fo" -> "MZXQ" (before padding)
        assert_eq!(base32_encode(b"fo"), "MZXQ");
        assert_eq!(base32_encode(b""), "");
        // 4 bytes yield 7 characters, id generation keeps 6
        assert_eq!(base32_encode(&[0, 0, 0, 0]).len(), 7);
    }

    // ============================================================================
    // Session Lifecycle Tests
    // ============================================================================

    #[test]
    fn test_create_and_lookup() {
        let manager = SessionManager::new();
        let session = manager.create_session("/srv/shared");

        let found = manager.lookup(&session.id).expect("session should exist");
        assert_eq!(found.passcode, session.passcode);
        assert_eq!(found.shared_path, "/srv/shared");
        assert!(found.active);
        assert!(!found.locked);
    }

    #[test]
    fn test_lookup_unknown_is_none() {
        let manager = SessionManager::new();
        assert!(manager.lookup("ZZZZZZ").is_none());
    }

    #[test]
    fn test_session_ids_unique() {
        let manager = SessionManager::new();
        let mut ids = std::collections::HashSet::new();
        for _ in 0..50 {
            let session = manager.create_session("/tmp");
            assert!(ids.insert(session.id), "duplicate session id");
        }
    }

    #[test]
    fn test_list_sessions() {
        let manager = SessionManager::new();
        assert!(manager.list_sessions().is_empty());

        let a = manager.create_session("/a");
        let b = manager.create_session("/b");
        assert_eq!(manager.session_count(), 2);

        let ids: Vec<String> = manager.list_sessions().into_iter().map(|s| s.id).collect();
        assert!(ids.contains(&a.id));
        assert!(ids.contains(&b.id));
    }

    #[test]
    fn test_revoke_removes_session() {
        let manager = SessionManager::new();
        let session = manager.create_session("/tmp");

        manager.revoke(&session.id).unwrap();
        assert!(manager.lookup(&session.id).is_none());
        assert!(matches!(manager.revoke(&session.id), Err(Error::SessionNotFound)));
    }

    // ============================================================================
    // Passcode Validation Tests
    // ============================================================================

    #[tokio::test]
    async fn test_validate_correct_passcode() {
        let manager = SessionManager::new();
        let session = manager.create_session("/tmp");

        assert!(manager
            .validate_passcode(&session.id, &session.passcode)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_validate_wrong_passcode_generic_error() {
        let manager = SessionManager::new();
        let session = manager.create_session("/tmp");

        let wrong = manager.validate_passcode(&session.id, "999-999").await;
        assert!(matches!(wrong, Err(Error::AuthenticationFailed)));

        // Unknown session id yields the same error, preventing enumeration
        let unknown = manager.validate_passcode("ZZZZZZ", "123-456").await;
        assert!(matches!(unknown, Err(Error::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn test_validation_takes_at_least_100ms() {
        let manager = SessionManager::new();
        let session = manager.create_session("/tmp");

        for passcode in [session.passcode.as_str(), "000-000"] {
            let start = Instant::now();
            let _ = manager.validate_passcode(&session.id, passcode).await;
            assert!(
                start.elapsed() >= Duration::from_millis(100),
                "validation returned too fast"
            );
        }

        // Unknown session also pays the full floor
        let start = Instant::now();
        let _ = manager.validate_passcode("NOSUCH", "000-000").await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_lockout_after_five_failures() {
        let manager = SessionManager::new();
        let session = manager.create_session("/tmp");

        for attempt in 1..=4 {
            let result = manager.validate_passcode(&session.id, "000-001").await;
            assert!(
                matches!(result, Err(Error::AuthenticationFailed)),
                "attempt {} should fail generically",
                attempt
            );
        }

        // Fifth wrong attempt latches the lock
        let fifth = manager.validate_passcode(&session.id, "000-001").await;
        assert!(matches!(fifth, Err(Error::SessionLocked)));

        // Locked stays locked, even with the right passcode
        let sixth = manager.validate_passcode(&session.id, &session.passcode).await;
        assert!(matches!(sixth, Err(Error::SessionLocked)));
    }

    #[tokio::test]
    async fn test_success_resets_attempt_counter() {
        let manager = SessionManager::new();
        let session = manager.create_session("/tmp");

        for _ in 0..4 {
            let _ = manager.validate_passcode(&session.id, "000-001").await;
        }
        assert!(manager
            .validate_passcode(&session.id, &session.passcode)
            .await
            .is_ok());

        // Counter is back to zero: four more wrong attempts do not lock
        for _ in 0..4 {
            let _ = manager.validate_passcode(&session.id, "000-001").await;
        }
        assert!(manager
            .validate_passcode(&session.id, &session.passcode)
            .await
            .is_ok());
    }

    // ============================================================================
    // Expiry and Sweeper Tests
    // ============================================================================

    #[test]
    fn test_sweep_removes_aged_sessions() {
        let clock = Arc::new(ManualClock::new());
        let manager = SessionManager::with_clock(clock.clone());

        let session = manager.create_session("/tmp");
        assert_eq!(manager.sweep(), 0);

        clock.advance(SESSION_TIMEOUT + Duration::from_secs(1));
        assert_eq!(manager.sweep(), 1);
        assert!(manager.lookup(&session.id).is_none());
    }

    #[test]
    fn test_sweep_removes_idle_sessions() {
        let clock = Arc::new(ManualClock::new());
        let manager = SessionManager::with_clock(clock.clone());

        let idle = manager.create_session("/tmp");
        let busy = manager.create_session("/tmp");

        clock.advance(IDLE_TIMEOUT - Duration::from_secs(10));
        manager.touch(&busy.id);

        clock.advance(Duration::from_secs(20));
        assert_eq!(manager.sweep(), 1);

        assert!(manager.lookup(&idle.id).is_none());
        assert!(manager.lookup(&busy.id).is_some(), "touched session survives");
    }

    #[tokio::test]
    async fn test_expired_session_fails_validation() {
        let clock = Arc::new(ManualClock::new());
        let manager = SessionManager::with_clock(clock.clone());

        let session = manager.create_session("/tmp");
        clock.advance(SESSION_TIMEOUT + Duration::from_secs(1));

        let result = manager.validate_passcode(&session.id, &session.passcode).await;
        assert!(matches!(result, Err(Error::AuthenticationFailed)));
        assert!(manager.lookup(&session.id).is_none(), "expired session removed");
    }
}

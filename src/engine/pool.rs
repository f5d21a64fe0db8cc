use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::engine::transport::{Connect, RemoteFs, TransportError};

/// Bounded pool of ready transfer sessions, established lazily and
/// reused across tasks. Sized at a multiple of the worker count so
/// workers can never deadlock waiting on each other's sessions.
pub struct SessionPool {
	connector: Arc<dyn Connect>,
	idle: Mutex<Vec<Box<dyn RemoteFs>>>,
	permits: Arc<Semaphore>,
}

impl SessionPool {
	pub fn new(connector: Arc<dyn Connect>, max_sessions: usize) -> Arc<SessionPool> {
		Arc::new(SessionPool {
			connector,
			idle: Mutex::new(Vec::new()),
			permits: Arc::new(Semaphore::new(max_sessions)),
		})
	}

	/// Check out a session, waiting while the pool is exhausted.
	/// Establishment is blocking ssh2 work and runs off the async
	/// runtime. A failed establishment keeps nothing: the slot frees up
	/// and the next acquire tries again.
	pub async fn acquire(self: &Arc<Self>) -> Result<PooledSession, TransportError> {
		let permit = self
			.permits
			.clone()
			.acquire_owned()
			.await
			.expect("session pool semaphore closed");

		let idle = self.idle.lock().expect("session pool poisoned").pop();
		let session = match idle {
			Some(session) => session,
			None => {
				let connector = self.connector.clone();
				tokio::task::spawn_blocking(move || connector.connect())
					.await
					.map_err(|e| TransportError::Connect(format!("connect task failed: {e}")))??
			}
		};

		Ok(PooledSession {
			session: Some(session),
			pool: self.clone(),
			_permit: permit,
		})
	}

	#[cfg(test)]
	pub fn idle_count(&self) -> usize {
		self.idle.lock().unwrap().len()
	}
}

/// A checked-out session with exactly one owner. Dropping the guard
/// destroys the session, which is the right default after a failure;
/// healthy sessions go back via [`release`](PooledSession::release).
pub struct PooledSession {
	session: Option<Box<dyn RemoteFs>>,
	pool: Arc<SessionPool>,
	_permit: OwnedSemaphorePermit,
}

impl PooledSession {
	pub fn remote(&mut self) -> &mut dyn RemoteFs {
		self.session
			.as_mut()
			.expect("session already returned")
			.as_mut()
	}

	/// Hand the session back for reuse.
	pub fn release(mut self) {
		if let Some(session) = self.session.take() {
			self.pool
				.idle
				.lock()
				.expect("session pool poisoned")
				.push(session);
		}
	}

	/// Destroy a possibly-broken session instead of returning it.
	pub fn discard(mut self) {
		self.session.take();
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::Ordering;
	use std::time::Duration;

	use super::*;
	use crate::engine::transport::testing::{MockConnect, RemoteState};

	fn pool_with(state: &Arc<RemoteState>, size: usize) -> Arc<SessionPool> {
		SessionPool::new(Arc::new(MockConnect::new(state.clone())), size)
	}

	#[tokio::test]
	async fn released_sessions_are_reused() {
		let state = RemoteState::new();
		let pool = pool_with(&state, 2);

		pool.acquire().await.unwrap().release();
		assert_eq!(pool.idle_count(), 1);

		pool.acquire().await.unwrap().release();
		assert_eq!(state.connects.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn discarded_sessions_are_not_reused() {
		let state = RemoteState::new();
		let pool = pool_with(&state, 2);

		pool.acquire().await.unwrap().discard();
		assert_eq!(pool.idle_count(), 0);

		pool.acquire().await.unwrap().release();
		assert_eq!(state.connects.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn acquire_blocks_at_capacity() {
		let state = RemoteState::new();
		let pool = pool_with(&state, 1);

		let held = pool.acquire().await.unwrap();
		let second = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
		assert!(second.is_err(), "second acquire should wait for the slot");

		held.release();
		let third = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
		assert!(third.is_ok());
	}

	#[tokio::test]
	async fn failed_establishment_frees_the_slot() {
		let state = RemoteState::new();
		state.fail_connects.store(1, Ordering::SeqCst);
		let pool = pool_with(&state, 1);

		assert!(pool.acquire().await.is_err());

		// The slot is free again and the next attempt reconnects.
		let session = tokio::time::timeout(Duration::from_millis(50), pool.acquire())
			.await
			.expect("slot should be free")
			.expect("second connect should succeed");
		session.release();
		assert_eq!(state.connects.load(Ordering::SeqCst), 2);
	}
}

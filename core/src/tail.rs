//! Resumable, keep-alive tail over a status journal.
//!
//! A spawned reader task polls the closed journal for growth and hands
//! lines to the serving side over a bounded channel; the serving side races
//! that handoff against a keep-alive timer and yields whichever fires
//! first. Dropping the stream cancels the reader through a drop guard: a
//! non-blocking, at-most-once signal that is safe even when the reader has
//! already finished on its own. The reader checks the signal between lines
//! rather than assuming the consumer keeps draining.
//!
//! Every delivered line is numbered from 1; a client that reconnects with
//! the index of the last line it processed resumes from the next one. Idle
//! frames never advance the index.

use std::{collections::HashSet, path::PathBuf, time::Duration};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::error;

use crate::{
	error::Result,
	events::StatusRecord,
	namespace::{TagName, Track, UpdateName},
	storage::{self, UpdateStore},
};

/// Absent journal: user-facing and non-alarming, the client keeps polling.
pub const NO_LOGS_MESSAGE: &str = "No rollout logs for this update yet.";
/// Any other storage failure: generic on the wire, detail in server logs.
pub const INTERRUPTED_MESSAGE: &str = "Logs tail was interrupted due to server error.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailFrame {
	/// One journal line; `id` is its position in the (filtered) journal.
	Log { id: u64, line: String },
	/// Keep-alive comment; consumes no index.
	Idle,
	/// Terminal error; `id` repeats the last successfully delivered index
	/// so a resuming client restarts at the correct line.
	Error { id: u64, message: String },
}

#[derive(Debug, Clone)]
pub struct TailOptions {
	/// Index of the last line the client already processed; 0 streams from
	/// the start.
	pub last_event_id: u64,
	pub keepalive: Duration,
	pub poll_interval: Duration,
}

impl Default for TailOptions {
	fn default() -> Self {
		Self {
			last_event_id: 0,
			keepalive: Duration::from_secs(30),
			poll_interval: Duration::from_millis(500),
		}
	}
}

/// Tails an update's journal, optionally narrowed to the devices of one
/// rollout. With a filter, only matching lines are delivered and numbered.
pub fn tail_journal(
	updates: &UpdateStore,
	track: Track,
	tag: &TagName,
	update: &UpdateName,
	filter: Option<HashSet<String>>,
	opts: TailOptions,
) -> impl Stream<Item = TailFrame> {
	let stop = CancellationToken::new();
	let rx = spawn_reader(
		updates.journal_path(track, tag, update),
		opts.poll_interval,
		stop.clone(),
	);
	let state = TailState {
		rx,
		_stop: stop.drop_guard(),
		filter,
		keepalive: opts.keepalive,
		last_event_id: opts.last_event_id,
		index: 0,
		done: false,
	};
	futures::stream::unfold(state, |mut st| async move {
		if st.done {
			return None;
		}
		loop {
			tokio::select! {
				next = st.rx.recv() => match next {
					Some(Ok(line)) => {
						if !st.matches(&line) {
							continue;
						}
						st.index += 1;
						if st.index <= st.last_event_id {
							// Already seen by the resuming client.
							continue;
						}
						return Some((TailFrame::Log { id: st.index, line }, st));
					}
					Some(Err(e)) => {
						st.done = true;
						let message = if e.is_not_found() {
							NO_LOGS_MESSAGE
						} else {
							error!(error = %e, "failed to tail rollout logs");
							INTERRUPTED_MESSAGE
						};
						return Some((
							TailFrame::Error { id: st.index, message: message.into() },
							st,
						));
					}
					None => {
						st.done = true;
						return None;
					}
				},
				_ = tokio::time::sleep(st.keepalive) => {
					return Some((TailFrame::Idle, st));
				}
			}
		}
	})
}

struct TailState {
	rx: mpsc::Receiver<Result<String>>,
	_stop: DropGuard,
	filter: Option<HashSet<String>>,
	keepalive: Duration,
	last_event_id: u64,
	index: u64,
	done: bool,
}

impl TailState {
	fn matches(&self, line: &str) -> bool {
		match &self.filter {
			None => true,
			// A line that does not parse as a status record cannot be
			// attributed to a device, so a scoped tail drops it.
			Some(devices) => serde_json::from_str::<StatusRecord>(line)
				.map(|record| devices.contains(&record.device))
				.unwrap_or(false),
		}
	}
}

/// Reads the closed journal from the beginning and keeps polling it for
/// growth, emitting each line once. Ends on the stop signal, on a closed
/// channel (consumer gone) or on the first read error, which is forwarded
/// as the terminal result.
fn spawn_reader(
	path: PathBuf,
	poll_interval: Duration,
	stop: CancellationToken,
) -> mpsc::Receiver<Result<String>> {
	let (tx, rx) = mpsc::channel(1);
	tokio::spawn(async move {
		let mut sent = 0;
		loop {
			let lines = match storage::read_journal_file(&path).await {
				Ok(lines) => lines,
				Err(e) => {
					let _ = tx.send(Err(e)).await;
					return;
				}
			};
			if lines.len() > sent {
				for line in lines.into_iter().skip(sent) {
					if stop.is_cancelled() {
						return;
					}
					sent += 1;
					if tx.send(Ok(line)).await.is_err() {
						return;
					}
				}
			} else {
				tokio::select! {
					_ = stop.cancelled() => return,
					_ = tokio::time::sleep(poll_interval) => {}
				}
			}
		}
	});
	rx
}

#[cfg(test)]
mod tests {
	use futures::StreamExt;

	use super::*;

	struct Fixture {
		_dir: tempfile::TempDir,
		updates: UpdateStore,
		tag: TagName,
		update: UpdateName,
	}

	async fn fixture() -> Fixture {
		let dir = tempfile::tempdir().unwrap();
		let updates = UpdateStore::new(dir.path()).unwrap();
		let tag = TagName::parse("master").unwrap();
		let update = UpdateName::parse("v23").unwrap();
		updates.create_update(Track::Ci, &tag, &update).await.unwrap();
		Fixture {
			_dir: dir,
			updates,
			tag,
			update,
		}
	}

	impl Fixture {
		async fn publish(&self, lines: &[&str]) {
			for line in lines {
				self.updates
					.append_journal(Track::Ci, &self.tag, &self.update, line)
					.await
					.unwrap();
			}
			self.updates
				.rollover_journal(Track::Ci, &self.tag, &self.update)
				.await
				.unwrap();
		}

		fn tail(&self, opts: TailOptions) -> impl Stream<Item = TailFrame> {
			tail_journal(&self.updates, Track::Ci, &self.tag, &self.update, None, opts)
		}
	}

	#[tokio::test(start_paused = true)]
	async fn delivers_each_line_once_in_order() {
		let fx = fixture().await;
		fx.publish(&["a", "b", "c"]).await;

		let mut tail = Box::pin(fx.tail(TailOptions::default()));
		for (id, line) in [(1, "a"), (2, "b"), (3, "c")] {
			assert_eq!(
				tail.next().await.unwrap(),
				TailFrame::Log { id, line: line.into() }
			);
		}
		// Nothing new within the keep-alive interval produces an idle frame,
		// not a duplicate.
		assert_eq!(tail.next().await.unwrap(), TailFrame::Idle);
	}

	#[tokio::test(start_paused = true)]
	async fn resumes_after_the_supplied_index() {
		let fx = fixture().await;
		fx.publish(&["a", "b", "c", "d"]).await;

		let mut tail = Box::pin(fx.tail(TailOptions {
			last_event_id: 2,
			..Default::default()
		}));
		assert_eq!(
			tail.next().await.unwrap(),
			TailFrame::Log { id: 3, line: "c".into() }
		);
		assert_eq!(
			tail.next().await.unwrap(),
			TailFrame::Log { id: 4, line: "d".into() }
		);
		assert_eq!(tail.next().await.unwrap(), TailFrame::Idle);
	}

	#[tokio::test(start_paused = true)]
	async fn picks_up_lines_published_later() {
		let fx = fixture().await;
		fx.publish(&["a"]).await;

		let mut tail = Box::pin(fx.tail(TailOptions::default()));
		assert_eq!(
			tail.next().await.unwrap(),
			TailFrame::Log { id: 1, line: "a".into() }
		);

		fx.publish(&["b"]).await;
		assert_eq!(
			tail.next().await.unwrap(),
			TailFrame::Log { id: 2, line: "b".into() }
		);
	}

	#[tokio::test(start_paused = true)]
	async fn idle_frames_do_not_advance_the_index() {
		let fx = fixture().await;
		fx.publish(&["a"]).await;

		let mut tail = Box::pin(fx.tail(TailOptions::default()));
		assert_eq!(
			tail.next().await.unwrap(),
			TailFrame::Log { id: 1, line: "a".into() }
		);
		assert_eq!(tail.next().await.unwrap(), TailFrame::Idle);
		assert_eq!(tail.next().await.unwrap(), TailFrame::Idle);

		fx.publish(&["b"]).await;
		assert_eq!(
			tail.next().await.unwrap(),
			TailFrame::Log { id: 2, line: "b".into() }
		);
	}

	#[tokio::test(start_paused = true)]
	async fn missing_journal_is_a_single_terminal_frame() {
		let fx = fixture().await;

		let mut tail = Box::pin(fx.tail(TailOptions::default()));
		assert_eq!(
			tail.next().await.unwrap(),
			TailFrame::Error {
				id: 0,
				message: NO_LOGS_MESSAGE.into()
			}
		);
		assert!(tail.next().await.is_none());
	}

	#[tokio::test(start_paused = true)]
	async fn cancelled_reader_stops_delivering() {
		let fx = fixture().await;
		fx.publish(&["a"]).await;

		let stop = CancellationToken::new();
		let mut rx = spawn_reader(
			fx.updates.journal_path(Track::Ci, &fx.tag, &fx.update),
			Duration::from_millis(500),
			stop.clone(),
		);
		assert_eq!(rx.recv().await.unwrap().unwrap(), "a");

		// After cancellation the reader exits and closes the channel, even
		// though more lines get published.
		stop.cancel();
		fx.publish(&["b"]).await;
		assert!(rx.recv().await.is_none());
	}

	#[tokio::test(start_paused = true)]
	async fn scoped_tail_numbers_only_matching_lines() {
		let fx = fixture().await;
		let record = |device: &str, corr: &str| {
			serde_json::to_string(&StatusRecord {
				device: device.into(),
				correlation_id: corr.into(),
				ecu: "main".into(),
				target_name: "t".into(),
				version: "23".into(),
				status: crate::events::InstallStatus::InProgress,
				details: String::new(),
				device_time: "2023-12-12T12:00:00".into(),
				event_type: "EcuDownloadStarted".into(),
			})
			.unwrap()
		};
		fx.publish(&[
			&record("dev-1", "c1"),
			&record("dev-2", "c2"),
			&record("dev-1", "c3"),
			&record("dev-2", "c4"),
		])
		.await;

		let filter: HashSet<String> = [String::from("dev-2")].into();
		let mut tail = Box::pin(tail_journal(
			&fx.updates,
			Track::Ci,
			&fx.tag,
			&fx.update,
			Some(filter),
			TailOptions::default(),
		));

		let frame = tail.next().await.unwrap();
		let TailFrame::Log { id, line } = frame else {
			panic!("expected a log frame, got {frame:?}");
		};
		assert_eq!(id, 1);
		assert!(line.contains("\"c2\""));

		let frame = tail.next().await.unwrap();
		let TailFrame::Log { id, line } = frame else {
			panic!("expected a log frame, got {frame:?}");
		};
		assert_eq!(id, 2);
		assert!(line.contains("\"c4\""));

		assert_eq!(tail.next().await.unwrap(), TailFrame::Idle);
	}
}

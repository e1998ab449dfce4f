//! Operator control of a running scan.
//!
//! Commands are messages; the dispatcher drains them at safe points, between
//! batches and between probe completions. The handle is cheap to clone and
//! hand to whatever drives it (a dashboard, a signal handler, a keybinding
//! loop).

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Pause,
    Resume,
    Stop,
    ResetStats,
    SaveProgress,
}

#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ControlHandle {
    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    pub fn reset_stats(&self) {
        self.send(Command::ResetStats);
    }

    pub fn save_progress(&self) {
        self.send(Command::SaveProgress);
    }

    fn send(&self, command: Command) {
        // a dropped receiver just means the scanner already exited
        let _ = self.tx.send(command);
    }
}

pub fn channel() -> (ControlHandle, mpsc::UnboundedReceiver<Command>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ControlHandle { tx }, rx)
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_commands_arrive_in_order() {
        let (handle, mut rx) = channel();

        handle.pause();
        handle.save_progress();
        handle.resume();
        handle.stop();

        assert_eq!(rx.recv().await, Some(Command::Pause));
        assert_eq!(rx.recv().await, Some(Command::SaveProgress));
        assert_eq!(rx.recv().await, Some(Command::Resume));
        assert_eq!(rx.recv().await, Some(Command::Stop));
    }

    #[tokio::test]
    async fn test_send_after_scanner_exit_is_quiet() {
        let (handle, rx) = channel();
        drop(rx);
        handle.stop();
    }
}

//! Desktop notifications for agent signal transitions.

use std::sync::Arc;

use tracing::debug;

use crate::config::NotificationsConfig;
use crate::signal::{Signal, SignalState};

pub struct NotificationService {
    sound_disabled: bool,
}

impl NotificationService {
    pub fn new(config: &NotificationsConfig) -> Arc<Self> {
        Arc::new(Self {
            sound_disabled: config.sound_disabled,
        })
    }

    /// Notify on the states a supervisor cares about; `working` ticks are
    /// noise and stay on the dashboard only.
    pub fn on_signal(&self, session_label: &str, signal: &Signal) {
        let title = match signal.state {
            SignalState::NeedsInput => format!("{session_label} needs input"),
            SignalState::NeedsTesting => format!("{session_label} ready for testing"),
            SignalState::Completed => format!("{session_label} completed"),
            SignalState::Error => format!("{session_label} hit an error"),
            SignalState::Working => return,
        };
        self.send(&title, &signal.message);
    }

    #[cfg(target_os = "linux")]
    fn send(&self, title: &str, body: &str) {
        use notify_rust::Notification;
        let mut notification = Notification::new();
        notification.summary(title).body(body).appname("schmux");
        if !self.sound_disabled {
            notification.sound_name("message-new-instant");
        }
        if let Err(e) = notification.show() {
            debug!("desktop notification failed: {e}");
        }
    }

    #[cfg(target_os = "macos")]
    fn send(&self, title: &str, body: &str) {
        let mut notification = mac_notification_sys::Notification::default();
        notification.title(title).message(body);
        if !self.sound_disabled {
            notification.sound("Ping");
        }
        if let Err(e) = notification.send() {
            debug!("desktop notification failed: {e}");
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn send(&self, title: &str, body: &str) {
        debug!(title, body, "notifications unsupported on this platform");
    }
}

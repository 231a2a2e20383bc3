use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Fail-stop switch shared by every periodically updated component.
///
/// The first update that returns an error or panics disables the component
/// for good and records why. Later updates are ignored, so a broken component
/// stays quiet instead of failing on every tick.
#[derive(Debug)]
pub struct ComponentHealth {
    component: &'static str,
    failure: Mutex<Option<String>>,
}

impl ComponentHealth {
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            failure: Mutex::new(None),
        }
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    pub fn is_disabled(&self) -> bool {
        self.failure.lock().is_some()
    }

    /// Reason the component was disabled, if it was.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Runs one update unless the component is disabled. Errors and panics
    /// are contained here and disable the component.
    pub fn guard<T>(&self, update: impl FnOnce() -> anyhow::Result<T>) -> Option<T> {
        if self.is_disabled() {
            return None;
        }
        match panic::catch_unwind(AssertUnwindSafe(update)) {
            Ok(Ok(value)) => Some(value),
            Ok(Err(error)) => {
                self.disable(format!("{error:#}"));
                None
            }
            Err(payload) => {
                self.disable(format!("panicked: {}", panic_message(payload.as_ref())));
                None
            }
        }
    }

    fn disable(&self, reason: String) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            log::error!("{} disabled after an unexpected failure: {reason}", self.component);
            *failure = Some(reason);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

use std::io;
use std::thread::{self, JoinHandle};

use crate::work::Failure;

/// Body of one execution unit; its return value is the item's result.
pub type Unit = Box<dyn FnOnce() -> Result<(), Failure> + Send + 'static>;

/// Starts execution units for the dispatcher.
///
/// `launch` must run `unit` on a different thread from the caller: the
/// dispatcher holds its slot table lock while launching, and a finishing unit
/// takes that lock to mark its slot free.
pub trait Launcher: Send + Sync {
    fn launch(
        &self,
        index: usize,
        name: String,
        unit: Unit,
    ) -> io::Result<JoinHandle<Result<(), Failure>>>;
}

/// One named OS thread per started item.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadLauncher;

impl ThreadLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl Launcher for ThreadLauncher {
    fn launch(
        &self,
        _index: usize,
        name: String,
        unit: Unit,
    ) -> io::Result<JoinHandle<Result<(), Failure>>> {
        thread::Builder::new().name(name).spawn(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_launcher_names_the_thread() {
        let handle = ThreadLauncher::new()
            .launch(
                0,
                "fanout-item-0".to_string(),
                Box::new(|| {
                    let name = thread::current().name().map(str::to_string);
                    if name.as_deref() == Some("fanout-item-0") {
                        Ok(())
                    } else {
                        Err(Failure::new(format!("unexpected thread name {name:?}")))
                    }
                }),
            )
            .expect("spawn should succeed");
        handle.join().expect("unit should not panic").unwrap();
    }
}

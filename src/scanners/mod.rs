pub mod bash;
pub mod busybox;
pub mod generic;
pub mod posix;

pub use bash::BashDialect;
pub use busybox::BusyboxDialect;
pub use generic::GenericDialect;
pub use posix::PosixDialect;

/// A shell that can enumerate the programs on an image's `PATH`.
pub trait ShellDialect: Send + Sync {
    /// Name of the shell binary under `/bin`.
    fn shell(&self) -> &'static str;

    /// Command that succeeds inside the image when the shell exists.
    fn presence_test(&self) -> String {
        format!("[ -e /bin/{} ]", self.shell())
    }

    /// Command printing one executable basename per line, sorted and unique.
    fn listing_command(&self) -> String;
}

/// Every supported dialect, most capable first.
pub fn supported() -> Vec<Box<dyn ShellDialect>> {
    vec![
        Box::new(BashDialect::new()),
        Box::new(BusyboxDialect::new()),
        Box::new(PosixDialect::new()),
    ]
}

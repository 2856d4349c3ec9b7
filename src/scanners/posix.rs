use super::busybox::PERM_FIND;
use super::{GenericDialect, ShellDialect};

pub struct PosixDialect(GenericDialect);

impl PosixDialect {
    pub fn new() -> Self {
        Self(GenericDialect::new("sh", "sh", PERM_FIND))
    }
}

impl Default for PosixDialect {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for PosixDialect {
    type Target = GenericDialect;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ShellDialect for PosixDialect {
    fn shell(&self) -> &'static str {
        self.0.shell()
    }

    fn listing_command(&self) -> String {
        self.0.listing_command()
    }
}

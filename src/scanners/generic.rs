use super::ShellDialect;

/// Dialect described by an interpreter and the `find` pipeline it runs.
pub struct GenericDialect {
    shell: &'static str,
    interpreter: &'static str,
    find: &'static str,
}

impl GenericDialect {
    pub fn new(shell: &'static str, interpreter: &'static str, find: &'static str) -> Self {
        Self { shell, interpreter, find }
    }
}

impl ShellDialect for GenericDialect {
    fn shell(&self) -> &'static str {
        self.shell
    }

    fn listing_command(&self) -> String {
        format!("{} -c '{}' 2>/dev/null", self.interpreter, self.find)
    }
}

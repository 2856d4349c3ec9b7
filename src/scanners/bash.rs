use super::{GenericDialect, ShellDialect};

const BASH_FIND: &str = concat!(
    r#"export IFS=":"; find $PATH -maxdepth 1 \( -type l -o -type f \) -executable "#,
    r#"-exec basename {} \; | sort -u"#,
);

pub struct BashDialect(GenericDialect);

impl BashDialect {
    pub fn new() -> Self {
        Self(GenericDialect::new("bash", "bash", BASH_FIND))
    }
}

impl Default for BashDialect {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for BashDialect {
    type Target = GenericDialect;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ShellDialect for BashDialect {
    fn shell(&self) -> &'static str {
        self.0.shell()
    }

    fn listing_command(&self) -> String {
        self.0.listing_command()
    }
}

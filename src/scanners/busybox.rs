use super::{GenericDialect, ShellDialect};

/// Busybox `find` has no `-executable`, so each `PATH` entry is checked by mode.
pub(crate) const PERM_FIND: &str = concat!(
    r#"export IFS=":"; for dir in $PATH; do [ -e "$dir" ] && "#,
    r#"find $dir -maxdepth 1 \( -type l -o -type f \) -perm +111 -exec basename {} \;; "#,
    r#"done | sort -u"#,
);

pub struct BusyboxDialect(GenericDialect);

impl BusyboxDialect {
    pub fn new() -> Self {
        Self(GenericDialect::new("busybox", "sh", PERM_FIND))
    }
}

impl Default for BusyboxDialect {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for BusyboxDialect {
    type Target = GenericDialect;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl ShellDialect for BusyboxDialect {
    fn shell(&self) -> &'static str {
        self.0.shell()
    }

    fn listing_command(&self) -> String {
        self.0.listing_command()
    }
}

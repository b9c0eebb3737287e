//! Shared macros for the backend crate.

/// Implement `fmt::Debug` for a struct while hiding secret fields.
///
/// Each field is listed with how it is shown:
///
/// - `show field` prints the value
/// - `redact field` prints `"[REDACTED]"`
/// - `redact_option field` prints `Some("[REDACTED]")` or `None`
///
/// ```ignore
/// redacted_debug!(Config {
///     redact database_url,
///     show bind_address,
///     redact_option encryption_passphrase,
/// });
/// ```
macro_rules! redacted_debug {
    ($name:ident { $( $kind:ident $field:ident ),* $(,)? }) => {
        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                let mut s = f.debug_struct(stringify!($name));
                $( redacted_debug!(@field s, self, $kind, $field); )*
                s.finish_non_exhaustive()
            }
        }
    };
    (@field $s:ident, $self:ident, show, $field:ident) => {
        $s.field(stringify!($field), &$self.$field);
    };
    (@field $s:ident, $self:ident, redact, $field:ident) => {
        $s.field(stringify!($field), &"[REDACTED]");
    };
    (@field $s:ident, $self:ident, redact_option, $field:ident) => {
        $s.field(stringify!($field), &$self.$field.as_ref().map(|_| "[REDACTED]"));
    };
}

#[cfg(test)]
mod tests {
    #[allow(dead_code)]
    struct ArchiveTarget {
        host: String,
        token: String,
        passphrase: Option<String>,
    }

    redacted_debug!(ArchiveTarget {
        show host,
        redact token,
        redact_option passphrase,
    });

    #[test]
    fn test_secrets_hidden() {
        let target = ArchiveTarget {
            host: "backup-01".into(),
            token: "tok-123".into(),
            passphrase: Some("swordfish".into()),
        };
        let output = format!("{:?}", target);
        assert!(output.contains("backup-01"));
        assert!(!output.contains("tok-123"));
        assert!(!output.contains("swordfish"));
        assert!(output.contains("[REDACTED]"));
    }

    #[test]
    fn test_absent_option_shown_as_none() {
        let target = ArchiveTarget {
            host: "backup-02".into(),
            token: "tok".into(),
            passphrase: None,
        };
        assert!(format!("{:?}", target).contains("passphrase: None"));
    }
}

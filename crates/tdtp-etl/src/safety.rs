//! SQL safety gate: every transform query is checked against this before it
//! reaches the workspace.
//!
//! Safe mode (the default) only lets a query through if its root statement
//! is `SELECT` or `WITH`. Unsafe mode widens the allowed verbs but is only
//! honored when the caller both opts in *and* carries admin authority;
//! otherwise the request is rejected as a permission error rather than
//! silently downgraded to safe mode.

use tdtp_proto::error::{Result, TdtpError};

const UNSAFE_VERBS: &[&str] = &["INSERT", "UPDATE", "DELETE", "CREATE", "DROP", "ALTER", "TRUNCATE"];

/// Strips a leading run of `--` line comments and `/* */` block comments so
/// the root verb check isn't fooled by a commented-out prefix.
fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(stripped) = rest.strip_prefix("--") {
            rest = stripped.splitn(2, '\n').nth(1).unwrap_or("").trim_start();
        } else if let Some(stripped) = rest.strip_prefix("/*") {
            match stripped.find("*/") {
                Some(end) => rest = stripped[end + 2..].trim_start(),
                None => break,
            }
        } else {
            break;
        }
    }
    rest
}

fn root_verb(sql: &str) -> String {
    strip_leading_comments(sql)
        .split(|c: char| c.is_whitespace() || c == '(')
        .find(|tok| !tok.is_empty())
        .unwrap_or("")
        .to_ascii_uppercase()
}

/// Validates `sql` is allowed to run. `unsafe_mode` and `admin_authority`
/// must both be true to widen beyond `SELECT`/`WITH`.
pub fn validate_transform_sql(sql: &str, unsafe_mode: bool, admin_authority: bool) -> Result<()> {
    let verb = root_verb(sql);

    if matches!(verb.as_str(), "SELECT" | "WITH") {
        return Ok(());
    }

    if !unsafe_mode {
        return Err(TdtpError::validation(format!(
            "statement '{verb}' is not permitted under the safety gate; only SELECT/WITH are allowed"
        )));
    }
    if !admin_authority {
        return Err(TdtpError::Permission(format!(
            "unsafe mode requires host admin authority to run '{verb}'"
        )));
    }
    if UNSAFE_VERBS.contains(&verb.as_str()) {
        return Ok(());
    }
    Err(TdtpError::validation(format!(
        "statement '{verb}' has no recognized form, safe or unsafe"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_and_with_pass_in_safe_mode() {
        assert!(validate_transform_sql("SELECT * FROM t", false, false).is_ok());
        assert!(validate_transform_sql("  with cte as (select 1) select * from cte", false, false).is_ok());
    }

    #[test]
    fn drop_is_rejected_in_safe_mode() {
        let err = validate_transform_sql("DROP TABLE users", false, false).unwrap_err();
        assert!(matches!(err, TdtpError::Validation(_)));
    }

    #[test]
    fn unsafe_mode_without_admin_authority_is_a_permission_error() {
        let err = validate_transform_sql("DROP TABLE users", true, false).unwrap_err();
        assert!(matches!(err, TdtpError::Permission(_)));
    }

    #[test]
    fn unsafe_mode_with_admin_authority_allows_ddl() {
        assert!(validate_transform_sql("DROP TABLE users", true, true).is_ok());
    }

    #[test]
    fn leading_comment_does_not_hide_the_real_verb() {
        let err = validate_transform_sql("-- harmless looking\nDROP TABLE users", false, false).unwrap_err();
        assert!(matches!(err, TdtpError::Validation(_)));
    }
}

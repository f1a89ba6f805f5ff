//! Session security context: identity parsing from the startup username and
//! construction of the injection query.

use std::collections::HashMap;

use crate::config::Config;
use crate::errors::Error;
use crate::messages::{escape_literal, escape_set_value, quote_ident};

/// Ordered session-variable map.
///
/// Order matters: the injection query emits the configured context variables
/// in declaration order, then resolver outputs in execution order. Lookups
/// by name are needed by the resolver engine for parameter binding.
#[derive(Debug, Default)]
pub struct SessionContext {
    entries: Vec<(String, Option<String>)>,
    index: HashMap<String, usize>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a variable. First insertion fixes its position.
    pub fn set(&mut self, name: &str, value: Option<String>) {
        match self.index.get(name) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(name.to_string(), self.entries.len());
                self.entries.push((name.to_string(), value));
            }
        }
    }

    /// `None` = unknown variable; `Some(None)` = known but NULL.
    pub fn get(&self, name: &str) -> Option<&Option<String>> {
        self.index.get(name).map(|&i| &self.entries[i].1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Option<String>)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The identity a tenant connection presented in its startup username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// The login role left of the separator; the startup `user` parameter
    /// is rewritten to this before the upstream sees it.
    pub login_role: String,
    /// Positional context values right of the separator.
    pub context_values: Vec<String>,
}

impl ClientIdentity {
    /// The registry key: the first positional value is the tenant id.
    pub fn tenant_id(&self) -> &str {
        &self.context_values[0]
    }
}

/// Classification of the raw startup username.
#[derive(Debug, PartialEq, Eq)]
pub enum UserClass {
    /// Listed in `superuser_bypass`: forwarded verbatim, never pooled.
    Bypass,
    /// Carries an identity payload.
    Tenant(ClientIdentity),
}

/// Parse the raw startup `user` value against the configured grammar.
pub fn classify_user(config: &Config, raw_user: &str) -> Result<UserClass, Error> {
    if raw_user.is_empty() {
        return Err(Error::UserUnspecified);
    }

    if config.superuser_bypass.iter().any(|u| u == raw_user) {
        return Ok(UserClass::Bypass);
    }

    let Some(sep) = raw_user.find(&config.tenant_separator) else {
        return Err(Error::BadIdentity(format!(
            "username must contain context values separated by '{}'",
            config.tenant_separator
        )));
    };

    let login_role = &raw_user[..sep];
    let payload = &raw_user[sep + config.tenant_separator.len()..];

    if login_role.is_empty() || payload.is_empty() {
        return Err(Error::BadIdentity(
            "empty role or context in username".to_string(),
        ));
    }

    // With a single context variable the payload is taken whole, so tenant
    // ids may contain the value separator.
    let context_values: Vec<String> = if config.context_variables.len() > 1 {
        payload
            .split(&config.value_separator)
            .map(|s| s.to_string())
            .collect()
    } else {
        vec![payload.to_string()]
    };

    if context_values.len() != config.context_variables.len() {
        return Err(Error::BadIdentity(format!(
            "expected {} context value(s), got {}",
            config.context_variables.len(),
            context_values.len()
        )));
    }

    if context_values.iter().any(|v| v.is_empty()) {
        return Err(Error::BadIdentity(
            "empty context value in username".to_string(),
        ));
    }

    Ok(UserClass::Tenant(ClientIdentity {
        login_role: login_role.to_string(),
        context_values,
    }))
}

/// Seed the session context from the parsed identity, validating every
/// value against the identity charset.
pub fn initial_context(config: &Config, identity: &ClientIdentity) -> Result<SessionContext, Error> {
    let mut context = SessionContext::new();
    for (name, value) in config
        .context_variables
        .iter()
        .zip(identity.context_values.iter())
    {
        // Validation only; the literal is re-escaped at injection time.
        escape_literal(value)?;
        context.set(name, Some(value.clone()));
    }
    Ok(context)
}

/// Build the injection batch: one simple query with every context SET in
/// declaration order, resolver outputs behind them, and `SET ROLE` last.
///
/// The server runs the batch as an implicit transaction, so either the
/// whole context lands or none of it does. The trailing SET ROLE is what
/// RLS policies key off even if an earlier statement were somehow skipped.
pub fn build_injection_sql(
    config: &Config,
    context: &SessionContext,
    login_role: &str,
) -> Result<String, Error> {
    let mut statements = Vec::with_capacity(context.len() + 1);

    for (name, value) in context.iter() {
        let Some(value) = value else {
            // NULL outputs from optional resolvers have nothing to SET.
            continue;
        };
        let is_identity_value = config.context_variables.iter().any(|n| n == name);
        let literal = if is_identity_value {
            escape_literal(value)?
        } else {
            escape_set_value(value)
        };
        statements.push(format!("SET {name} = {literal}"));
    }

    let role = config.set_role.as_deref().unwrap_or(login_role);
    statements.push(format!("SET ROLE {}", quote_ident(role)?));

    Ok(statements.join("; ") + ";")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_vars(vars: &[&str]) -> Config {
        let mut config = Config::default();
        config.context_variables = vars.iter().map(|s| s.to_string()).collect();
        config
    }

    #[test]
    fn classify_bypass_user() {
        let config = Config::default();
        assert_eq!(classify_user(&config, "postgres").unwrap(), UserClass::Bypass);
    }

    #[test]
    fn classify_tenant_user() {
        let config = Config::default();
        match classify_user(&config, "app_user.acme").unwrap() {
            UserClass::Tenant(identity) => {
                assert_eq!(identity.login_role, "app_user");
                assert_eq!(identity.context_values, vec!["acme"]);
                assert_eq!(identity.tenant_id(), "acme");
            }
            other => panic!("expected tenant, got {other:?}"),
        }
    }

    #[test]
    fn classify_rejects_missing_separator() {
        let config = Config::default();
        assert!(matches!(
            classify_user(&config, "baduser"),
            Err(Error::BadIdentity(_))
        ));
    }

    #[test]
    fn classify_rejects_empty_parts() {
        let config = Config::default();
        assert!(classify_user(&config, ".acme").is_err());
        assert!(classify_user(&config, "app_user.").is_err());
        assert!(classify_user(&config, "").is_err());
    }

    #[test]
    fn classify_multiple_values() {
        let config = config_with_vars(&["app.list", "app.user"]);
        match classify_user(&config, "app_user.L1:U7").unwrap() {
            UserClass::Tenant(identity) => {
                assert_eq!(identity.context_values, vec!["L1", "U7"]);
            }
            other => panic!("expected tenant, got {other:?}"),
        }
    }

    #[test]
    fn classify_rejects_wrong_value_count() {
        let config = config_with_vars(&["app.list", "app.user"]);
        assert!(classify_user(&config, "app_user.L1").is_err());
        assert!(classify_user(&config, "app_user.L1:U7:extra").is_err());
    }

    #[test]
    fn classify_rejects_empty_value() {
        let config = config_with_vars(&["app.list", "app.user"]);
        assert!(classify_user(&config, "app_user.L1:").is_err());
        assert!(classify_user(&config, "app_user.:U7").is_err());
    }

    #[test]
    fn single_variable_payload_keeps_value_separator() {
        let config = Config::default();
        match classify_user(&config, "app_user.a:b").unwrap() {
            UserClass::Tenant(identity) => {
                assert_eq!(identity.context_values, vec!["a:b"]);
            }
            other => panic!("expected tenant, got {other:?}"),
        }
    }

    #[test]
    fn injection_sql_single_variable() {
        let config = Config::default();
        let identity = ClientIdentity {
            login_role: "app_user".into(),
            context_values: vec!["acme".into()],
        };
        let context = initial_context(&config, &identity).unwrap();
        let sql = build_injection_sql(&config, &context, "app_user").unwrap();
        assert_eq!(
            sql,
            "SET app.current_tenant_id = 'acme'; SET ROLE \"app_user\";"
        );
    }

    #[test]
    fn injection_sql_two_variables_in_config_order() {
        let config = config_with_vars(&["app.list", "app.user"]);
        let identity = ClientIdentity {
            login_role: "app_user".into(),
            context_values: vec!["L1".into(), "U7".into()],
        };
        let context = initial_context(&config, &identity).unwrap();
        let sql = build_injection_sql(&config, &context, "app_user").unwrap();
        assert_eq!(
            sql,
            "SET app.list = 'L1'; SET app.user = 'U7'; SET ROLE \"app_user\";"
        );
    }

    #[test]
    fn injection_sql_resolver_values_after_config_values() {
        let config = Config::default();
        let identity = ClientIdentity {
            login_role: "app_user".into(),
            context_values: vec!["acme".into()],
        };
        let mut context = initial_context(&config, &identity).unwrap();
        context.set("app.org_id", Some("org-1".into()));
        context.set("app.features", Some("{a,b}".into()));
        context.set("app.optional", None);

        let sql = build_injection_sql(&config, &context, "app_user").unwrap();
        assert_eq!(
            sql,
            "SET app.current_tenant_id = 'acme'; SET app.org_id = 'org-1'; \
             SET app.features = '{a,b}'; SET ROLE \"app_user\";"
        );
    }

    #[test]
    fn injection_sql_ends_with_set_role_override() {
        let mut config = Config::default();
        config.set_role = Some("rls_role".into());
        let identity = ClientIdentity {
            login_role: "app_user".into(),
            context_values: vec!["acme".into()],
        };
        let context = initial_context(&config, &identity).unwrap();
        let sql = build_injection_sql(&config, &context, "app_user").unwrap();
        assert!(sql.ends_with("SET ROLE \"rls_role\";"));
    }

    #[test]
    fn injection_rejects_hostile_values() {
        let config = Config::default();
        let identity = ClientIdentity {
            login_role: "app_user".into(),
            context_values: vec!["acme'; DROP TABLE tenants; --".into()],
        };
        assert!(initial_context(&config, &identity).is_err());
    }

    #[test]
    fn resolver_values_are_quote_doubled_not_rejected() {
        let config = Config::default();
        let identity = ClientIdentity {
            login_role: "app_user".into(),
            context_values: vec!["acme".into()],
        };
        let mut context = initial_context(&config, &identity).unwrap();
        context.set("app.display_name", Some("O'Brien & Sons".into()));
        let sql = build_injection_sql(&config, &context, "app_user").unwrap();
        assert!(sql.contains("SET app.display_name = 'O''Brien & Sons';"));
    }

    #[test]
    fn session_context_preserves_insertion_order() {
        let mut context = SessionContext::new();
        context.set("b", Some("2".into()));
        context.set("a", Some("1".into()));
        context.set("b", Some("3".into())); // update keeps position
        let names: Vec<&str> = context.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(context.get("b"), Some(&Some("3".to_string())));
        assert_eq!(context.get("missing"), None);
    }
}

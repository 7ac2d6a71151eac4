//! Template-based identity mapping between chat users and carrier identities.
//!
//! Puppet templates describe the localparts of the users the bridge
//! impersonates, e.g. `_voip_%REMOTE_ID%`. Route templates describe which real
//! chat user a carrier callee is delivered to, e.g. remote `%REMOTE_ID%` to
//! user `@%REMOTE_ID%:example.org`, or a fixed number to a fixed user.

use crate::config::{RouteConfig, UserTemplateConfig};
use crate::error::IdentityError;
use crate::mxid::{MatrixId, decode_localpart, encode_localpart};

pub const REMOTE_ID_PLACEHOLDER: &str = "%REMOTE_ID%";

/// A string pattern with at most one `%REMOTE_ID%` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    raw: String,
    prefix: String,
    suffix: Option<String>,
}

impl Template {
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let invalid = |reason: &str| IdentityError::InvalidTemplate {
            template: raw.to_string(),
            reason: reason.to_string(),
        };
        if raw.is_empty() {
            return Err(invalid("template is empty"));
        }
        match raw.split_once(REMOTE_ID_PLACEHOLDER) {
            Some((prefix, suffix)) => {
                if suffix.contains(REMOTE_ID_PLACEHOLDER) {
                    return Err(invalid("placeholder appears more than once"));
                }
                Ok(Self {
                    raw: raw.to_string(),
                    prefix: prefix.to_string(),
                    suffix: Some(suffix.to_string()),
                })
            }
            None => Ok(Self {
                raw: raw.to_string(),
                prefix: raw.to_string(),
                suffix: None,
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn has_placeholder(&self) -> bool {
        self.suffix.is_some()
    }

    /// Returns what the placeholder matched, or `""` for a literal template.
    pub fn capture<'a>(&self, value: &'a str) -> Option<&'a str> {
        match &self.suffix {
            None => (value == self.prefix).then_some(""),
            Some(suffix) => {
                let rest = value.strip_prefix(self.prefix.as_str())?;
                let captured = rest.strip_suffix(suffix.as_str())?;
                (!captured.is_empty()).then_some(captured)
            }
        }
    }

    pub fn render(&self, remote_id: &str) -> String {
        match &self.suffix {
            None => self.prefix.clone(),
            Some(suffix) => format!("{}{}{}", self.prefix, remote_id, suffix),
        }
    }
}

/// Resolves identities across the two protocols.
///
/// `Ok(None)` means "no mapping", which callers must tell apart from an error.
pub trait IdentityMapper: Send + Sync {
    /// The carrier identity a puppet user stands for.
    fn resolve_remote_identity(&self, chat_user: &str) -> Result<Option<String>, IdentityError>;

    /// The real chat user a carrier callee is delivered to.
    fn resolve_chat_user(&self, remote_id: &str) -> Result<Option<String>, IdentityError>;

    /// The puppet user that represents a carrier identity in chat.
    fn puppet_for(&self, remote_id: &str) -> Result<String, IdentityError>;

    fn is_puppet(&self, chat_user: &str) -> bool {
        matches!(self.resolve_remote_identity(chat_user), Ok(Some(_)))
    }
}

#[derive(Debug, Clone)]
struct Route {
    remote: Template,
    user: Template,
}

/// [`IdentityMapper`] driven by puppet localpart templates and delivery routes.
#[derive(Debug, Clone)]
pub struct TemplateIdentityMapper {
    domain: String,
    puppets: Vec<Template>,
    routes: Vec<Route>,
}

impl TemplateIdentityMapper {
    pub fn new(
        domain: impl Into<String>,
        users: &[UserTemplateConfig],
        routes: &[RouteConfig],
    ) -> Result<Self, IdentityError> {
        let puppets = users
            .iter()
            .map(|u| Template::parse(&u.template))
            .collect::<Result<Vec<_>, _>>()?;
        if puppets.is_empty() {
            return Err(IdentityError::NoTemplate);
        }
        let routes = routes
            .iter()
            .map(|r| {
                Ok(Route {
                    remote: Template::parse(&r.remote)?,
                    user: Template::parse(&r.user)?,
                })
            })
            .collect::<Result<Vec<_>, IdentityError>>()?;
        Ok(Self {
            domain: domain.into(),
            puppets,
            routes,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl IdentityMapper for TemplateIdentityMapper {
    fn resolve_remote_identity(&self, chat_user: &str) -> Result<Option<String>, IdentityError> {
        let id = MatrixId::parse(chat_user)?;
        if id.domain() != self.domain {
            return Ok(None);
        }
        for template in &self.puppets {
            if let Some(encoded) = template.capture(id.localpart()) {
                return Ok(decode_localpart(encoded));
            }
        }
        Ok(None)
    }

    fn resolve_chat_user(&self, remote_id: &str) -> Result<Option<String>, IdentityError> {
        for route in &self.routes {
            if let Some(captured) = route.remote.capture(remote_id) {
                let user = route.user.render(captured);
                MatrixId::parse(&user)?;
                return Ok(Some(user));
            }
        }
        Ok(None)
    }

    fn puppet_for(&self, remote_id: &str) -> Result<String, IdentityError> {
        let template = self.puppets.first().ok_or(IdentityError::NoTemplate)?;
        let localpart = template.render(&encode_localpart(remote_id));
        Ok(MatrixId::new(localpart, &self.domain).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper(routes: &[(&str, &str)]) -> TemplateIdentityMapper {
        let users = vec![UserTemplateConfig {
            template: "_voip_%REMOTE_ID%".into(),
        }];
        let routes: Vec<RouteConfig> = routes
            .iter()
            .map(|(remote, user)| RouteConfig {
                remote: remote.to_string(),
                user: user.to_string(),
            })
            .collect();
        TemplateIdentityMapper::new("example.org", &users, &routes).expect("valid templates")
    }

    #[test]
    fn template_capture_and_render() {
        let t = Template::parse("_voip_%REMOTE_ID%").expect("valid");
        assert_eq!(t.capture("_voip_5551234"), Some("5551234"));
        assert_eq!(t.capture("_voip_"), None);
        assert_eq!(t.capture("alice"), None);
        assert_eq!(t.render("42"), "_voip_42");

        let literal = Template::parse("@alice:example.org").expect("valid");
        assert!(!literal.has_placeholder());
        assert_eq!(literal.capture("@alice:example.org"), Some(""));
        assert_eq!(literal.render("ignored"), "@alice:example.org");

        assert!(Template::parse("%REMOTE_ID%_%REMOTE_ID%").is_err());
        assert!(Template::parse("").is_err());
    }

    #[test]
    fn resolves_puppets_both_ways() {
        let m = mapper(&[]);
        assert_eq!(
            m.resolve_remote_identity("@_voip_5551234:example.org"),
            Ok(Some("5551234".to_string()))
        );
        assert_eq!(m.resolve_remote_identity("@alice:example.org"), Ok(None));
        assert_eq!(m.resolve_remote_identity("@_voip_1:elsewhere.org"), Ok(None));
        assert!(m.resolve_remote_identity("not-an-id").is_err());

        assert_eq!(
            m.puppet_for("+15551234").as_deref(),
            Ok("@_voip_=2b15551234:example.org")
        );
        assert_eq!(
            m.resolve_remote_identity("@_voip_=2b15551234:example.org"),
            Ok(Some("+15551234".to_string()))
        );
        assert!(m.is_puppet("@_voip_1:example.org"));
    }

    #[test]
    fn routes_deliver_to_chat_users() {
        let m = mapper(&[("1000", "@alice:example.org"), ("ext%REMOTE_ID%", "@%REMOTE_ID%:example.org")]);
        assert_eq!(m.resolve_chat_user("1000"), Ok(Some("@alice:example.org".to_string())));
        assert_eq!(m.resolve_chat_user("extbob"), Ok(Some("@bob:example.org".to_string())));
        assert_eq!(m.resolve_chat_user("5550000"), Ok(None));
    }
}

//! Entities and endpoint policies — the matching surface the navigator
//! consumes.
//!
//! An [`Entity`] is a network identity: an IP plus whatever intelligence was
//! attached to it upstream (country, ASN). The fabric never looks identities
//! up itself; entities arrive populated. A [`Policy`] is an ordered rule
//! list evaluated against entities; the first matching rule decides.
//!
//! A rule that needs data the entity does not carry yields
//! [`PolicyVerdict::MatchError`] — the "geo database is broken" shape. The
//! navigator treats that as fail-safe (no match), never as a deny.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// A network identity used for policy matching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub ip: Option<IpAddr>,
    pub country: Option<String>,
    pub asn: Option<u32>,
}

impl Entity {
    pub fn from_ip(ip: IpAddr) -> Self {
        Self {
            ip: Some(ip),
            ..Self::default()
        }
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn with_asn(mut self, asn: u32) -> Self {
        self.asn = Some(asn);
        self
    }
}

/// Outcome of evaluating a policy against an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyVerdict {
    Permitted,
    Denied,
    NoMatch,
    MatchError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    Permit,
    Deny,
}

/// What a single rule matches on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntityMatcher {
    /// Matches every entity.
    Any,
    /// ISO country code, as attached to the entity upstream.
    Country(String),
    /// Autonomous system number.
    Asn(u32),
    /// IP network in `address/prefix` form.
    Net { ip: IpAddr, prefix: u8 },
}

/// One ordered policy rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRule {
    pub action: RuleAction,
    pub matcher: EntityMatcher,
}

impl EndpointRule {
    pub fn permit(matcher: EntityMatcher) -> Self {
        Self {
            action: RuleAction::Permit,
            matcher,
        }
    }

    pub fn deny(matcher: EntityMatcher) -> Self {
        Self {
            action: RuleAction::Deny,
            matcher,
        }
    }
}

enum RuleMatch {
    Matched,
    NoMatch,
    Error(&'static str),
}

impl EntityMatcher {
    fn check(&self, entity: &Entity) -> RuleMatch {
        match self {
            Self::Any => RuleMatch::Matched,
            Self::Country(code) => match entity.country.as_deref() {
                Some(country) if country.eq_ignore_ascii_case(code) => RuleMatch::Matched,
                Some(_) => RuleMatch::NoMatch,
                None => RuleMatch::Error("entity has no country data"),
            },
            Self::Asn(asn) => match entity.asn {
                Some(got) if got == *asn => RuleMatch::Matched,
                Some(_) => RuleMatch::NoMatch,
                None => RuleMatch::Error("entity has no ASN data"),
            },
            Self::Net { ip, prefix } => match entity.ip {
                Some(got) if ip_in_net(got, *ip, *prefix) => RuleMatch::Matched,
                _ => RuleMatch::NoMatch,
            },
        }
    }
}

fn ip_in_net(ip: IpAddr, net: IpAddr, prefix: u8) -> bool {
    match (ip, net) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let prefix = prefix.min(32) as u32;
            if prefix == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - prefix);
            (u32::from(ip) & mask) == (u32::from(net) & mask)
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let prefix = prefix.min(128) as u32;
            if prefix == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - prefix);
            (u128::from(ip) & mask) == (u128::from(net) & mask)
        }
        _ => false,
    }
}

/// An ordered endpoint list. Empty policies are "not set" and match nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub rules: Vec<EndpointRule>,
}

impl Policy {
    pub fn new(rules: Vec<EndpointRule>) -> Self {
        Self { rules }
    }

    /// A one-rule policy denying everything.
    pub fn deny_all() -> Self {
        Self::new(vec![EndpointRule::deny(EntityMatcher::Any)])
    }

    /// A one-rule policy permitting everything.
    pub fn permit_all() -> Self {
        Self::new(vec![EndpointRule::permit(EntityMatcher::Any)])
    }

    pub fn is_set(&self) -> bool {
        !self.rules.is_empty()
    }

    /// Evaluate against one entity. First matching rule decides; a rule
    /// that cannot be evaluated aborts with `MatchError`.
    pub fn match_entity(&self, entity: &Entity) -> (PolicyVerdict, String) {
        for rule in &self.rules {
            match rule.matcher.check(entity) {
                RuleMatch::Matched => {
                    let verdict = match rule.action {
                        RuleAction::Permit => PolicyVerdict::Permitted,
                        RuleAction::Deny => PolicyVerdict::Denied,
                    };
                    return (verdict, format!("matched rule {:?}", rule.matcher));
                }
                RuleMatch::NoMatch => {}
                RuleMatch::Error(reason) => {
                    return (PolicyVerdict::MatchError, reason.to_string());
                }
            }
        }
        (PolicyVerdict::NoMatch, "no rule matched".to_string())
    }

    /// Evaluate against a pin's v4 and v6 entities. Rules are walked in
    /// order; the first rule that matches either family decides.
    pub fn match_multi(
        &self,
        entity_v4: Option<&Entity>,
        entity_v6: Option<&Entity>,
    ) -> (PolicyVerdict, String) {
        if entity_v4.is_none() && entity_v6.is_none() {
            return (PolicyVerdict::NoMatch, "no entity data".to_string());
        }
        for rule in &self.rules {
            for entity in [entity_v4, entity_v6].into_iter().flatten() {
                match rule.matcher.check(entity) {
                    RuleMatch::Matched => {
                        let verdict = match rule.action {
                            RuleAction::Permit => PolicyVerdict::Permitted,
                            RuleAction::Deny => PolicyVerdict::Denied,
                        };
                        return (verdict, format!("matched rule {:?}", rule.matcher));
                    }
                    RuleMatch::NoMatch => {}
                    RuleMatch::Error(reason) => {
                        return (PolicyVerdict::MatchError, reason.to_string());
                    }
                }
            }
        }
        (PolicyVerdict::NoMatch, "no rule matched".to_string())
    }
}

/// Advisory policies attached to the whole map by the intelligence feed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubIntel {
    /// Applies to every hub role.
    #[serde(default)]
    pub hub_advisory: Policy,
    /// Additionally applies when picking a home hub.
    #[serde(default)]
    pub home_hub_advisory: Policy,
    /// Additionally applies when picking a destination hub.
    #[serde(default)]
    pub destination_hub_advisory: Policy,
}

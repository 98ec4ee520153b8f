//! Map query options and the compiled pin matcher.
//!
//! [`Options`] describe what a caller wants from the map; `matcher`
//! compiles them into a pure predicate over pins. Compilation resolves the
//! defaults and the hub-type adjustments once, so evaluating a pin is cheap
//! and the predicate returns the same answer for the same inputs no matter
//! how often it runs.

use tracing::warn;

use crate::intel::{Entity, HubIntel, Policy, PolicyVerdict};

use super::pin::{Pin, PinState};

/// The role a hub is being considered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubType {
    Home,
    Transit,
    Destination,
}

/// A compiled matching function generated from [`Options`].
pub type PinMatcher = Box<dyn Fn(&Pin) -> bool + Send + Sync>;

/// Configuration for operations on the map.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Required states; only hubs carrying all of them are considered.
    /// Unless `no_defaults` is set, a basic desirable set is added.
    pub regard: PinState,

    /// Disqualifying states; hubs carrying any of them are skipped.
    /// Unless `no_defaults` is set, a basic undesirable set is added.
    pub disregard: PinState,

    /// Endpoint lists a hub must pass to be considered.
    pub hub_policies: Vec<Policy>,

    /// Entity that must pass the hub's entry policy.
    pub check_hub_entry_policy_with: Option<Entity>,

    /// Entity that must pass the hub's exit policy. The exit probe consults
    /// the hub's exit policy — the entry policy cannot answer whether
    /// traffic may leave towards this entity.
    pub check_hub_exit_policy_with: Option<Entity>,

    /// When non-empty, only hubs whose verified owner is in this list pass.
    pub require_verified_owners: Vec<String>,

    /// Skip the default and recommended regard/disregard states.
    pub no_defaults: bool,

    /// Only use destination hubs carrying the Trusted state.
    pub require_trusted_destination_hubs: bool,

    /// Route-finding algorithm selector.
    pub routing_profile: String,
}

impl Options {
    /// Whether any hub policy is set and non-empty.
    pub fn hub_policies_are_set(&self) -> bool {
        self.hub_policies.iter().any(Policy::is_set)
    }

    /// Compile these options into a predicate over pins.
    pub fn matcher(&self, hub_type: HubType, hub_intel: Option<&HubIntel>) -> PinMatcher {
        // Compile states to regard and disregard.
        let mut regard = self.regard;
        let mut disregard = self.disregard;

        if !self.no_defaults {
            regard |= PinState::SUMMARY_REGARD;
            disregard |= PinState::SUMMARY_DISREGARD;

            match hub_type {
                HubType::Home => {
                    // A home hub does not need to be reachable from the
                    // network or have active keys yet; we dial it directly.
                    regard.remove(PinState::REACHABLE);
                    regard.remove(PinState::ACTIVE);
                    disregard |= PinState::USAGE_AS_HOME_DISCOURAGED;
                }
                HubType::Transit => {}
                HubType::Destination => {
                    disregard |= PinState::USAGE_AS_DESTINATION_DISCOURAGED;
                    disregard |= PinState::CONNECTIVITY_ISSUES;
                }
            }
        }

        if self.require_trusted_destination_hubs && hub_type == HubType::Destination {
            regard |= PinState::TRUSTED;
        }

        // Append advisory policies from the intelligence feed.
        let mut hub_policies = self.hub_policies.clone();
        if let Some(intel) = hub_intel {
            hub_policies.push(intel.hub_advisory.clone());
            match hub_type {
                HubType::Home => hub_policies.push(intel.home_hub_advisory.clone()),
                HubType::Transit => {}
                HubType::Destination => {
                    hub_policies.push(intel.destination_hub_advisory.clone())
                }
            }
        }

        let require_verified_owners = self.require_verified_owners.clone();
        let entry_entity = self.check_hub_entry_policy_with.clone();
        let exit_entity = self.check_hub_exit_policy_with.clone();

        Box::new(move |pin: &Pin| {
            // Cheapest first: required and disqualifying state bits.
            if !pin.state.has(regard) || pin.state.has_any_of(disregard) {
                return false;
            }

            // Verified owner allow-list.
            if !require_verified_owners.is_empty() {
                match pin.verified_owner.as_deref() {
                    Some(owner) if require_verified_owners.iter().any(|a| a == owner) => {}
                    _ => return false,
                }
            }

            // Hub policies: Denied aborts, Permitted ends the policy walk,
            // a match error is logged and treated as no match so a broken
            // intelligence source cannot deny every hub.
            'policies: for policy in &hub_policies {
                if !policy.is_set() {
                    continue;
                }
                let (verdict, reason) =
                    policy.match_multi(pin.entity_v4.as_ref(), pin.entity_v6.as_ref());
                match verdict {
                    PolicyVerdict::NoMatch => {}
                    PolicyVerdict::MatchError => {
                        warn!(hub = %pin.hub.id, %reason, "navigator: policy match failed");
                    }
                    PolicyVerdict::Denied => return false,
                    PolicyVerdict::Permitted => break 'policies,
                }
            }

            // Entry/exit probes against the caller-supplied entity.
            if let Some(entity) = entry_entity.as_ref() {
                if pin.hub.entry_policy.match_entity(entity).0 == PolicyVerdict::Denied {
                    return false;
                }
            }
            if let Some(entity) = exit_entity.as_ref() {
                if pin.hub.exit_policy.match_entity(entity).0 == PolicyVerdict::Denied {
                    return false;
                }
            }

            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use crate::intel::{EndpointRule, EntityMatcher};

    fn pin_with_state(id: &str, state: PinState) -> Pin {
        let mut pin = Pin::new(Hub::new(id));
        pin.state = state;
        pin
    }

    fn summary_ok() -> PinState {
        PinState::REACHABLE | PinState::ACTIVE
    }

    #[test]
    fn defaults_require_summary_regard() {
        let opts = Options::default();
        let matcher = opts.matcher(HubType::Transit, None);

        assert!(matcher(&pin_with_state("h1", summary_ok())));
        assert!(!matcher(&pin_with_state("h2", PinState::REACHABLE)));
        assert!(!matcher(&pin_with_state(
            "h3",
            summary_ok() | PinState::FAILING
        )));
    }

    #[test]
    fn no_defaults_skips_summary_states() {
        let opts = Options {
            no_defaults: true,
            ..Options::default()
        };
        let matcher = opts.matcher(HubType::Transit, None);
        assert!(matcher(&pin_with_state("h1", PinState::empty())));
    }

    #[test]
    fn home_hubs_do_not_need_reachable_or_active() {
        let opts = Options::default();
        let matcher = opts.matcher(HubType::Home, None);
        assert!(matcher(&pin_with_state("h1", PinState::empty())));
        assert!(!matcher(&pin_with_state(
            "h2",
            PinState::USAGE_AS_HOME_DISCOURAGED
        )));
    }

    #[test]
    fn destination_hubs_disregard_connectivity_issues() {
        let opts = Options::default();
        let matcher = opts.matcher(HubType::Destination, None);
        assert!(matcher(&pin_with_state("h1", summary_ok())));
        assert!(!matcher(&pin_with_state(
            "h2",
            summary_ok() | PinState::CONNECTIVITY_ISSUES
        )));
        assert!(!matcher(&pin_with_state(
            "h3",
            summary_ok() | PinState::USAGE_AS_DESTINATION_DISCOURAGED
        )));
        // Transit matching ignores both.
        let transit = opts.matcher(HubType::Transit, None);
        assert!(transit(&pin_with_state(
            "h4",
            summary_ok() | PinState::CONNECTIVITY_ISSUES
        )));
    }

    #[test]
    fn trusted_destination_requirement() {
        let opts = Options {
            require_trusted_destination_hubs: true,
            ..Options::default()
        };
        let matcher = opts.matcher(HubType::Destination, None);
        assert!(!matcher(&pin_with_state("h1", summary_ok())));
        assert!(matcher(&pin_with_state(
            "h2",
            summary_ok() | PinState::TRUSTED
        )));
        // The requirement only binds destination matching.
        let home = opts.matcher(HubType::Home, None);
        assert!(home(&pin_with_state("h3", PinState::empty())));
    }

    #[test]
    fn verified_owner_allow_list() {
        let opts = Options {
            require_verified_owners: vec!["Acme".into()],
            no_defaults: true,
            ..Options::default()
        };
        let matcher = opts.matcher(HubType::Transit, None);

        let mut owned = pin_with_state("h1", PinState::empty());
        owned.verified_owner = Some("Acme".into());
        assert!(matcher(&owned));

        let mut other = pin_with_state("h2", PinState::empty());
        other.verified_owner = Some("Evil Corp".into());
        assert!(!matcher(&other));

        let unowned = pin_with_state("h3", PinState::empty());
        assert!(!matcher(&unowned));
    }

    #[test]
    fn denied_policy_short_circuits() {
        let opts = Options {
            hub_policies: vec![Policy::deny_all(), Policy::permit_all()],
            no_defaults: true,
            ..Options::default()
        };
        let matcher = opts.matcher(HubType::Transit, None);
        let mut pin = pin_with_state("h1", PinState::empty());
        pin.entity_v4 = Some(Entity::from_ip("192.0.2.1".parse().unwrap()));
        assert!(!matcher(&pin));
    }

    #[test]
    fn permitted_policy_ends_the_policy_walk() {
        let opts = Options {
            hub_policies: vec![Policy::permit_all(), Policy::deny_all()],
            no_defaults: true,
            ..Options::default()
        };
        let matcher = opts.matcher(HubType::Transit, None);
        let mut pin = pin_with_state("h1", PinState::empty());
        pin.entity_v4 = Some(Entity::from_ip("192.0.2.1".parse().unwrap()));
        assert!(matcher(&pin));
    }

    #[test]
    fn match_error_is_fail_safe() {
        // A country rule against an entity without country data errors;
        // the pin must still pass when everything else is fine.
        let opts = Options {
            hub_policies: vec![Policy::new(vec![EndpointRule::deny(
                EntityMatcher::Country("US".into()),
            )])],
            no_defaults: true,
            ..Options::default()
        };
        let matcher = opts.matcher(HubType::Transit, None);
        let mut pin = pin_with_state("h1", PinState::empty());
        pin.entity_v4 = Some(Entity::from_ip("192.0.2.1".parse().unwrap()));
        assert!(matcher(&pin));
    }

    #[test]
    fn intel_advisories_apply_per_hub_type() {
        let intel = HubIntel {
            home_hub_advisory: Policy::deny_all(),
            ..HubIntel::default()
        };
        let opts = Options {
            no_defaults: true,
            ..Options::default()
        };
        let mut pin = pin_with_state("h1", PinState::empty());
        pin.entity_v4 = Some(Entity::from_ip("192.0.2.1".parse().unwrap()));

        let home = opts.matcher(HubType::Home, Some(&intel));
        assert!(!home(&pin));
        let transit = opts.matcher(HubType::Transit, Some(&intel));
        assert!(transit(&pin));
    }

    #[test]
    fn entry_probe_denies_and_exit_probe_uses_exit_policy() {
        let mut hub = Hub::new("h1");
        hub.entry_policy = Policy::new(vec![EndpointRule::deny(EntityMatcher::Net {
            ip: "10.0.0.0".parse().unwrap(),
            prefix: 8,
        })]);
        hub.exit_policy = Policy::deny_all();
        let mut pin = Pin::new(hub);
        pin.state = PinState::empty();

        let blocked_entry = Options {
            check_hub_entry_policy_with: Some(Entity::from_ip("10.1.2.3".parse().unwrap())),
            no_defaults: true,
            ..Options::default()
        };
        assert!(!blocked_entry.matcher(HubType::Home, None)(&pin));

        let allowed_entry = Options {
            check_hub_entry_policy_with: Some(Entity::from_ip("192.0.2.9".parse().unwrap())),
            no_defaults: true,
            ..Options::default()
        };
        assert!(allowed_entry.matcher(HubType::Home, None)(&pin));

        // The exit probe consults the exit policy, which denies everything.
        let exit_checked = Options {
            check_hub_exit_policy_with: Some(Entity::from_ip("192.0.2.9".parse().unwrap())),
            no_defaults: true,
            ..Options::default()
        };
        assert!(!exit_checked.matcher(HubType::Destination, None)(&pin));
    }

    #[test]
    fn matcher_is_pure() {
        let opts = Options::default();
        let matcher = opts.matcher(HubType::Transit, None);
        let pin = pin_with_state("h1", summary_ok());
        let first = matcher(&pin);
        for _ in 0..10 {
            assert_eq!(matcher(&pin), first);
        }
    }
}

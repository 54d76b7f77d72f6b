//! In-memory iptables for tests.
//!
//! Implements [`CommandExecutor`] and understands the handful of commands
//! chainban issues, rendering `--list -n -v` the way iptables does. Rule
//! deletion is positional, so out-of-order deletes show up as wrong state.

use anyhow::Result;
use std::sync::Mutex;

use crate::cmd_abstraction::{CommandExecutor, CommandOutput};

const HEADER: &str =
    " pkts bytes target     prot opt in     out     source               destination";
const BUILTINS: [&str; 3] = ["INPUT", "FORWARD", "OUTPUT"];
const ANY: &str = "0.0.0.0/0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeRule {
    pub target: String,
    pub source: String,
    pub destination: String,
}

#[derive(Debug, Clone)]
struct FakeChain {
    name: String,
    rules: Vec<FakeRule>,
}

#[derive(Debug, Default)]
struct State {
    chains: Vec<FakeChain>,
    mutations: Vec<String>,
    listings: usize,
    fail_on: Option<String>,
}

#[derive(Debug)]
pub struct FakeIptables {
    state: Mutex<State>,
}

impl Default for FakeIptables {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeIptables {
    /// Only the built-in chains, all empty.
    pub fn new() -> Self {
        let chains = BUILTINS
            .iter()
            .map(|name| FakeChain {
                name: name.to_string(),
                rules: Vec::new(),
            })
            .collect();
        Self {
            state: Mutex::new(State {
                chains,
                ..State::default()
            }),
        }
    }

    /// Built-ins plus all four chainban chains, linked, with no rules.
    pub fn with_topology() -> Self {
        let fake = Self::new();
        for (parent, chains) in [
            ("INPUT", ["chainban-toxic-input", "chainban-input"]),
            ("OUTPUT", ["chainban-toxic-output", "chainban-output"]),
        ] {
            for chain in chains {
                fake.add_chain(chain);
                fake.push_rule(
                    parent,
                    FakeRule {
                        target: chain.to_string(),
                        source: ANY.to_string(),
                        destination: ANY.to_string(),
                    },
                );
            }
        }
        fake
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_chain(&self, name: &str) {
        self.lock().chains.push(FakeChain {
            name: name.to_string(),
            rules: Vec::new(),
        });
    }

    pub fn push_rule(&self, chain: &str, rule: FakeRule) {
        let mut state = self.lock();
        if let Some(c) = state.chains.iter_mut().find(|c| c.name == chain) {
            c.rules.push(rule);
        }
    }

    /// Append a `DROP` rule for `addr` in the given column.
    pub fn push_drop(&self, chain: &str, addr: &str, destination: bool) {
        let (source, destination) = if destination {
            (ANY.to_string(), addr.to_string())
        } else {
            (addr.to_string(), ANY.to_string())
        };
        self.push_rule(
            chain,
            FakeRule {
                target: "DROP".to_string(),
                source,
                destination,
            },
        );
    }

    /// Addresses in the active column of each rule, in rule order.
    pub fn addresses(&self, chain: &str) -> Vec<String> {
        let state = self.lock();
        state
            .chains
            .iter()
            .find(|c| c.name == chain)
            .map(|c| {
                c.rules
                    .iter()
                    .map(|r| {
                        if r.source == ANY {
                            r.destination.clone()
                        } else {
                            r.source.clone()
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn rules(&self, chain: &str) -> Vec<FakeRule> {
        let state = self.lock();
        state
            .chains
            .iter()
            .find(|c| c.name == chain)
            .map(|c| c.rules.clone())
            .unwrap_or_default()
    }

    pub fn has_chain(&self, chain: &str) -> bool {
        self.lock().chains.iter().any(|c| c.name == chain)
    }

    /// Every mutation command applied, as `"-A chain -s addr -j DROP"`.
    pub fn mutations(&self) -> Vec<String> {
        self.lock().mutations.clone()
    }

    pub fn clear_mutations(&self) {
        self.lock().mutations.clear();
    }

    pub fn listings(&self) -> usize {
        self.lock().listings
    }

    /// Fail any command whose joined arguments start with `prefix`.
    pub fn fail_on(&self, prefix: &str) {
        self.lock().fail_on = Some(prefix.to_string());
    }

    pub fn clear_failure(&self) {
        self.lock().fail_on = None;
    }

    fn render(state: &State) -> String {
        let mut out = String::new();
        for chain in &state.chains {
            if BUILTINS.contains(&chain.name.as_str()) {
                out.push_str(&format!(
                    "Chain {} (policy ACCEPT 0 packets, 0 bytes)\n",
                    chain.name
                ));
            } else {
                let refs = state
                    .chains
                    .iter()
                    .flat_map(|c| &c.rules)
                    .filter(|r| r.target == chain.name)
                    .count();
                out.push_str(&format!("Chain {} ({} references)\n", chain.name, refs));
            }
            out.push_str(HEADER);
            out.push('\n');
            for rule in &chain.rules {
                out.push_str(&format!(
                    "    0     0 {:<10} all  --  *      *       {:<20} {}\n",
                    rule.target, rule.source, rule.destination
                ));
            }
            out.push('\n');
        }
        out
    }

    fn apply(state: &mut State, args: &[String]) -> std::result::Result<(), String> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let find = |state: &mut State, name: &str| -> std::result::Result<usize, String> {
            state
                .chains
                .iter()
                .position(|c| c.name == name)
                .ok_or_else(|| format!("iptables: No chain/target/match by that name ({})", name))
        };

        match args.as_slice() {
            ["-N", name] => {
                if state.chains.iter().any(|c| c.name == *name) {
                    return Err("iptables: Chain already exists.".to_string());
                }
                state.chains.push(FakeChain {
                    name: name.to_string(),
                    rules: Vec::new(),
                });
            }
            ["-I", parent, "1", "-j", target] => {
                find(state, *target)?;
                let pos = find(state, *parent)?;
                state.chains[pos].rules.insert(
                    0,
                    FakeRule {
                        target: target.to_string(),
                        source: ANY.to_string(),
                        destination: ANY.to_string(),
                    },
                );
            }
            ["-A", chain, flag @ ("-s" | "-d"), addr, "-j", target] => {
                let pos = find(state, *chain)?;
                let (source, destination) = if *flag == "-s" {
                    (addr.to_string(), ANY.to_string())
                } else {
                    (ANY.to_string(), addr.to_string())
                };
                state.chains[pos].rules.push(FakeRule {
                    target: target.to_string(),
                    source,
                    destination,
                });
            }
            ["-D", chain, index] => {
                let pos = find(state, *chain)?;
                let index: usize = index
                    .parse()
                    .map_err(|_| format!("iptables: bad rule number {}", index))?;
                let rules = &mut state.chains[pos].rules;
                if index == 0 || index > rules.len() {
                    return Err("iptables: Index of deletion too big.".to_string());
                }
                rules.remove(index - 1);
            }
            other => return Err(format!("unsupported command: {}", other.join(" "))),
        }
        Ok(())
    }
}

impl CommandExecutor for FakeIptables {
    fn execute(&self, _cmd: &str, args: &[String]) -> Result<CommandOutput> {
        let mut state = self.lock();
        let joined = args.join(" ");

        if let Some(prefix) = &state.fail_on {
            if joined.starts_with(prefix.as_str()) {
                return Ok(CommandOutput::failed("iptables: injected failure", 1));
            }
        }

        match joined.as_str() {
            "--list -n -v" => {
                state.listings += 1;
                return Ok(CommandOutput::ok(Self::render(&state)));
            }
            "--list INPUT -n" => return Ok(CommandOutput::ok("Chain INPUT (policy ACCEPT)\n")),
            _ => {}
        }

        match Self::apply(&mut state, args) {
            Ok(()) => {
                state.mutations.push(joined);
                Ok(CommandOutput::ok(""))
            }
            Err(msg) => Ok(CommandOutput::failed(msg, 1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_abstraction::args_to_strings;
    use crate::firewall::parse_listing;

    #[test]
    fn test_render_parses_back() {
        let fake = FakeIptables::with_topology();
        fake.push_drop("chainban-input", "1.2.3.4", false);
        fake.push_drop("chainban-output", "1.2.3.4", true);

        let out = fake
            .execute("iptables", &args_to_strings(&["--list", "-n", "-v"]))
            .unwrap();
        let lines: Vec<&str> = out.stdout.lines().collect();
        let chains = parse_listing(&lines);

        assert_eq!(chains.len(), 7);
        assert!(chains["INPUT"].links_to("chainban-input"));
        assert_eq!(chains["chainban-input"].rules[0].source(), Some("1.2.3.4"));
        assert_eq!(
            chains["chainban-output"].rules[0].destination(),
            Some("1.2.3.4")
        );
    }

    #[test]
    fn test_delete_out_of_range_fails() {
        let fake = FakeIptables::with_topology();
        let out = fake
            .execute("iptables", &args_to_strings(&["-D", "chainban-input", "1"]))
            .unwrap();
        assert!(!out.success);
        assert!(fake.mutations().is_empty());
    }
}

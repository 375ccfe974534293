//! The placement rules configuration: parsing `/etc/cgrules.conf`,
//! matching identities against it, and moving tasks accordingly.
//!
//! Each non-empty line maps an identity to a destination group:
//!
//! ```text
//! <user|@group|*>   <controller,...|*>   <destination>
//! ```
//!
//! A `%` in the subject column continues the previous rule with another
//! placement; `#` starts a comment. Rules match in file order, first match
//! wins.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use nix::unistd::{Gid, Group, Pid, Uid, User};

use crate::cgroup::Cgroup;
use crate::context::{read_lock, write_lock, Context};
use crate::error::{Error, Result};

/// Where the rules live unless a caller points elsewhere.
pub const RULES_CONF_PATH: &str = "/etc/cgrules.conf";

/// Upper bound on controllers in one rule line.
pub(crate) const MAX_RULE_CONTROLLERS: usize = 8;

/// The identity a rule applies to, resolved against the user and group
/// databases when the rule is parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSubject {
    User(Uid),
    /// A group, with its member names as of parse time. Membership is
    /// matched first by gid, then by looking the uid's login name up in the
    /// cached member list.
    Group { gid: Gid, members: Vec<String> },
    Wildcard,
}

impl RuleSubject {
    fn matches(&self, uid: Uid, gid: Gid) -> bool {
        match self {
            RuleSubject::Wildcard => true,
            RuleSubject::User(rule_uid) => *rule_uid == uid,
            RuleSubject::Group { gid: rule_gid, members } => {
                if *rule_gid == gid {
                    return true;
                }
                match User::from_uid(uid) {
                    Ok(Some(user)) => members.iter().any(|member| *member == user.name),
                    _ => false,
                }
            }
        }
    }
}

/// One placement: which controllers to touch and where the task goes. A
/// controller entry of `*` stands for every mounted controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulePlacement {
    pub controllers: Vec<String>,
    pub destination: String,
}

/// One rule of the configuration, together with the placements its
/// continuation lines added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    name: String,
    subject: RuleSubject,
    placement: RulePlacement,
    continuations: Vec<RulePlacement>,
}

impl Rule {
    /// The subject column as written in the configuration.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subject(&self) -> &RuleSubject {
        &self.subject
    }

    pub fn placement(&self) -> &RulePlacement {
        &self.placement
    }

    pub fn continuations(&self) -> &[RulePlacement] {
        &self.continuations
    }

    pub fn matches(&self, uid: Uid, gid: Gid) -> bool {
        self.subject.matches(uid, gid)
    }
}

/// Whether a parse reads the whole file or stops at the first rule matching
/// a given identity.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ParseMode {
    Cache,
    Lookup { uid: Uid, gid: Gid },
}

/// Parses a rules file. In cache mode the full rule list comes back. In
/// lookup mode parsing stops once the matching rule and its continuations
/// have been consumed, and only that rule comes back; the second half of
/// the return value says whether a match was found.
pub(crate) fn parse_rules(path: &Path, mode: ParseMode) -> Result<(Vec<Rule>, bool)> {
    let file = File::open(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => Error::RulesFileMissing,
        _ => Error::Other(err),
    })?;

    let mut rules: Vec<Rule> = Vec::new();
    let mut matched = false;
    // A rule whose subject could not be resolved is skipped with a warning,
    // and so are its continuations. In lookup mode, rules for other
    // identities are dropped silently together with their continuations.
    let mut skipped = false;
    let mut dropping = false;

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let linenum = index + 1;
        let text = line.split('#').next().unwrap_or("").trim();
        if text.is_empty() {
            continue;
        }

        let continuation = text.starts_with('%');
        if continuation && skipped {
            tracing::warn!("skipped child of invalid rule, line {}", linenum);
            continue;
        }

        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() != 3 {
            tracing::error!("failed to parse rules configuration, line {}", linenum);
            return Err(Error::ParseFailed);
        }
        let (subject_token, controller_field, destination) = (fields[0], fields[1], fields[2]);

        if matched && !continuation {
            // Lookup mode only: the match and its continuations are in.
            return Ok((rules, true));
        }

        if continuation {
            if dropping {
                continue;
            }
            let Some(rule) = rules.last_mut() else {
                tracing::error!("continuation without a preceding rule, line {}", linenum);
                return Err(Error::ParseFailed);
            };
            rule.continuations.push(RulePlacement {
                controllers: parse_controller_list(controller_field, linenum)?,
                destination: destination.to_owned(),
            });
            continue;
        }

        skipped = false;
        dropping = false;
        let subject = match resolve_subject(subject_token) {
            Some(subject) => subject,
            None => {
                tracing::warn!(
                    "entry for {} not found, skipping rule on line {}",
                    subject_token,
                    linenum
                );
                skipped = true;
                continue;
            }
        };

        if let ParseMode::Lookup { uid, gid } = mode {
            if subject.matches(uid, gid) {
                matched = true;
            } else {
                dropping = true;
                continue;
            }
        }

        let controllers = parse_controller_list(controller_field, linenum)?;
        tracing::debug!(
            "added rule {} -> {} for controllers {}",
            subject_token,
            destination,
            controller_field
        );
        rules.push(Rule {
            name: subject_token.to_owned(),
            subject,
            placement: RulePlacement {
                controllers,
                destination: destination.to_owned(),
            },
            continuations: Vec::new(),
        });
    }

    Ok((rules, matched))
}

fn parse_controller_list(field: &str, linenum: usize) -> Result<Vec<String>> {
    let controllers: Vec<String> = field
        .split(',')
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect();
    if controllers.is_empty() {
        tracing::error!("no controllers listed on line {}", linenum);
        return Err(Error::ParseFailed);
    }
    if controllers.len() > MAX_RULE_CONTROLLERS {
        tracing::error!("too many controllers listed on line {}", linenum);
        return Err(Error::ParseFailed);
    }
    Ok(controllers)
}

/// Resolves a subject column against the name databases. `None` means the
/// name does not exist; the caller decides what skipping looks like.
fn resolve_subject(token: &str) -> Option<RuleSubject> {
    if token == "*" {
        return Some(RuleSubject::Wildcard);
    }
    if let Some(group_name) = token.strip_prefix('@') {
        return match Group::from_name(group_name) {
            Ok(Some(group)) => Some(RuleSubject::Group {
                gid: group.gid,
                members: group.mem,
            }),
            _ => None,
        };
    }
    match User::from_name(token) {
        Ok(Some(user)) => Some(RuleSubject::User(user.uid)),
        _ => None,
    }
}

/// Which rule list [`Context::change_cgroup`] consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSource {
    /// Parse the configuration file afresh, stopping at the first match.
    File,
    /// Use the list loaded by [`Context::load_rules`].
    Cache,
}

impl Context {
    /// Loads (or reloads) the cached rule list from the default
    /// configuration file, replacing any previous list.
    pub fn load_rules(&self) -> Result<()> {
        self.load_rules_from(Path::new(RULES_CONF_PATH))
    }

    /// Loads (or reloads) the cached rule list from `path`.
    pub fn load_rules_from(&self, path: &Path) -> Result<()> {
        let (rules, _) = parse_rules(path, ParseMode::Cache)?;
        *write_lock(&self.rules) = rules;
        Ok(())
    }

    /// First cached rule matching `(uid, gid)`, in file order.
    pub fn resolve(&self, uid: Uid, gid: Gid) -> Option<Rule> {
        let rules = read_lock(&self.rules);
        rules.iter().find(|rule| rule.matches(uid, gid)).cloned()
    }

    /// Writes the cached rule list back out in configuration syntax, one
    /// line per placement. Reparsing the output reproduces the list.
    pub fn print_rules<W: Write>(&self, mut out: W) -> Result<()> {
        let rules = read_lock(&self.rules);
        for rule in rules.iter() {
            writeln!(
                out,
                "{}\t{}\t{}",
                rule.name,
                rule.placement.controllers.join(","),
                rule.placement.destination
            )?;
            for continuation in &rule.continuations {
                writeln!(
                    out,
                    "%\t{}\t{}",
                    continuation.controllers.join(","),
                    continuation.destination
                )?;
            }
        }
        Ok(())
    }

    /// Applies the first rule matching `(uid, gid)` to the task `pid`:
    /// every placement of the rule (the rule line plus its continuations)
    /// is executed in order. Returns whether a rule was applied; no match
    /// is not an error.
    pub fn change_cgroup(
        &self,
        uid: Uid,
        gid: Gid,
        pid: Pid,
        source: RuleSource,
    ) -> Result<bool> {
        match source {
            RuleSource::File => self.change_cgroup_from(Path::new(RULES_CONF_PATH), uid, gid, pid),
            RuleSource::Cache => {
                self.ensure_initialised()?;
                let Some(rule) = self.resolve(uid, gid) else {
                    tracing::debug!("no cached rule matches uid {} gid {}", uid, gid);
                    return Ok(false);
                };
                self.apply_rule(&rule, pid)?;
                Ok(true)
            }
        }
    }

    /// Like [`Context::change_cgroup`] with [`RuleSource::File`], reading
    /// the rules from `path`.
    pub fn change_cgroup_from(
        &self,
        path: &Path,
        uid: Uid,
        gid: Gid,
        pid: Pid,
    ) -> Result<bool> {
        self.ensure_initialised()?;
        let (rules, matched) = parse_rules(path, ParseMode::Lookup { uid, gid })?;
        if !matched {
            tracing::debug!("no rule matches uid {} gid {}", uid, gid);
            return Ok(false);
        }
        let Some(rule) = rules.into_iter().next() else {
            return Ok(false);
        };
        self.apply_rule(&rule, pid)?;
        Ok(true)
    }

    fn apply_rule(&self, rule: &Rule, pid: Pid) -> Result<()> {
        tracing::debug!("executing rule {} for pid {}", rule.name(), pid);
        self.execute_placement(rule.placement(), pid)?;
        for continuation in rule.continuations() {
            self.execute_placement(continuation, pid)?;
        }
        Ok(())
    }

    fn execute_placement(&self, placement: &RulePlacement, pid: Pid) -> Result<()> {
        let controllers: Vec<&str> = placement
            .controllers
            .iter()
            .map(String::as_str)
            .collect();
        self.change_cgroup_path(&placement.destination, pid, &controllers)
    }

    /// Moves `pid` into `destination` under the given controllers, without
    /// consulting any rules. A controller of `*` expands to every mounted
    /// controller.
    pub fn change_cgroup_path(
        &self,
        destination: &str,
        pid: Pid,
        controllers: &[&str],
    ) -> Result<()> {
        let cgroup = self.prepare_cgroup(destination, controllers)?;
        self.attach(Some(&cgroup), pid)
    }

    fn prepare_cgroup(&self, destination: &str, controllers: &[&str]) -> Result<Cgroup> {
        let mut cgroup = Cgroup::new(destination);
        for &controller in controllers {
            if controller == "*" {
                let names: Vec<String> = self.with_table(|table| {
                    Ok(table
                        .entries()
                        .iter()
                        .map(|entry| entry.controller.clone())
                        .collect())
                })?;
                for name in names {
                    cgroup.add_controller(&name)?;
                }
                return Ok(cgroup);
            }
            cgroup.add_controller(controller)?;
        }
        Ok(cgroup)
    }
}

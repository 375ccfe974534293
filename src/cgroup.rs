//! In-memory representation of a control group.
//!
//! A [`Cgroup`] is a plain value: a slash-separated group name, the owners
//! to stamp on creation, and an ordered list of controllers, each carrying
//! ordered `(attribute, value)` pairs. Values are never interpreted; the
//! kernel gives them meaning.

use nix::unistd::{getegid, geteuid, Gid, Uid};

use crate::error::{Error, Result};
use crate::mount::MAX_CONTROLLERS;

/// One attribute of a controller, e.g. `("cpu.shares", "512")`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlValue {
    name: String,
    value: String,
}

impl ControlValue {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// A controller attached to a cgroup, with its attribute values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupController {
    name: String,
    values: Vec<ControlValue>,
}

impl CgroupController {
    fn new(name: &str) -> Self {
        CgroupController {
            name: name.to_owned(),
            values: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[ControlValue] {
        &self.values
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|value| value.name == name)
            .map(|value| value.value.as_str())
    }

    /// Appends an attribute. Attribute names are unique within one
    /// controller; adding a name twice is refused.
    pub fn add_value(&mut self, name: &str, value: &str) -> Result<()> {
        if self.values.iter().any(|existing| existing.name == name) {
            return Err(Error::ValueExists);
        }
        self.values.push(ControlValue {
            name: name.to_owned(),
            value: value.to_owned(),
        });
        Ok(())
    }

    pub fn add_value_i64(&mut self, name: &str, value: i64) -> Result<()> {
        self.add_value(name, &value.to_string())
    }

    pub fn add_value_u64(&mut self, name: &str, value: u64) -> Result<()> {
        self.add_value(name, &value.to_string())
    }

    pub fn add_value_bool(&mut self, name: &str, value: bool) -> Result<()> {
        self.add_value(name, if value { "1" } else { "0" })
    }

    /// Updates an attribute in place, or appends it when absent.
    pub fn set_value(&mut self, name: &str, value: &str) {
        match self.values.iter_mut().find(|existing| existing.name == name) {
            Some(existing) => existing.value = value.to_owned(),
            None => self.values.push(ControlValue {
                name: name.to_owned(),
                value: value.to_owned(),
            }),
        }
    }

    /// Replaces this controller's attributes with deep copies of `other`'s,
    /// preserving their order.
    pub fn copy_values_from(&mut self, other: &CgroupController) {
        self.values = other.values.clone();
    }

    /// Structural comparison: same controller name and the same attribute
    /// values, position by position.
    pub fn compare(&self, other: &CgroupController) -> Result<()> {
        if self.name != other.name || self.values.len() != other.values.len() {
            return Err(Error::ControllersDiffer);
        }
        for (mine, theirs) in self.values.iter().zip(&other.values) {
            if mine != theirs {
                return Err(Error::ValuesNotEqual);
            }
        }
        Ok(())
    }
}

/// A control group as the caller wants it to exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cgroup {
    name: String,
    tasks_uid: Uid,
    tasks_gid: Gid,
    control_uid: Uid,
    control_gid: Gid,
    controllers: Vec<CgroupController>,
}

impl Cgroup {
    /// A new group with no controllers, owned by the calling process. The
    /// empty name addresses the hierarchy root.
    pub fn new(name: impl Into<String>) -> Self {
        Cgroup {
            name: name.into(),
            tasks_uid: geteuid(),
            tasks_gid: getegid(),
            control_uid: geteuid(),
            control_gid: getegid(),
            controllers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owner stamped onto the `tasks` file on creation.
    pub fn tasks_owner(&self) -> (Uid, Gid) {
        (self.tasks_uid, self.tasks_gid)
    }

    pub fn set_tasks_owner(&mut self, uid: Uid, gid: Gid) {
        self.tasks_uid = uid;
        self.tasks_gid = gid;
    }

    /// Owner stamped onto the group directory and its attribute files.
    pub fn control_owner(&self) -> (Uid, Gid) {
        (self.control_uid, self.control_gid)
    }

    pub fn set_control_owner(&mut self, uid: Uid, gid: Gid) {
        self.control_uid = uid;
        self.control_gid = gid;
    }

    /// Attaches a controller by name, or hands back the existing record
    /// when the controller is already declared.
    pub fn add_controller(&mut self, name: &str) -> Result<&mut CgroupController> {
        if let Some(index) = self
            .controllers
            .iter()
            .position(|controller| controller.name == name)
        {
            return Ok(&mut self.controllers[index]);
        }
        if self.controllers.len() == MAX_CONTROLLERS {
            return Err(Error::MaxExceeded);
        }
        self.controllers.push(CgroupController::new(name));
        let index = self.controllers.len() - 1;
        Ok(&mut self.controllers[index])
    }

    pub fn controller(&self, name: &str) -> Option<&CgroupController> {
        self.controllers
            .iter()
            .find(|controller| controller.name == name)
    }

    pub fn controllers(&self) -> &[CgroupController] {
        &self.controllers
    }

    pub fn clear_controllers(&mut self) {
        self.controllers.clear();
    }

    /// Replaces this group's controllers with deep copies of `other`'s.
    /// Names and owners are kept; only controller data is copied.
    pub fn copy_from(&mut self, other: &Cgroup) {
        self.controllers = other.controllers.clone();
    }

    /// Structural comparison of two groups' controller data. Controller
    /// order does not matter, attribute content does.
    pub fn compare(&self, other: &Cgroup) -> Result<()> {
        if self.controllers.len() != other.controllers.len() {
            return Err(Error::ControllersDiffer);
        }
        for mine in &self.controllers {
            let theirs = other
                .controller(&mine.name)
                .ok_or(Error::ControllersDiffer)?;
            mine.compare(theirs)?;
        }
        Ok(())
    }
}

//! Unit properties: reading, writing, and the value model they travel in.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use zvariant::{ObjectPath, OwnedValue, Type, Value};

use super::client::ManagerClient;
use super::context::CallContext;
use super::transport::{methods, Method, Transport};
use super::{ManagerError, Result};
use crate::escape::{parse_object_path, unit_path, validate_unit_name};

/// Interface carrying the properties common to every unit.
pub const UNIT_INTERFACE: &str = "org.freedesktop.systemd1.Unit";

/// Prefix of the unit-type specific interfaces (`...Service`, `...Socket`, ...).
pub const UNIT_TYPE_INTERFACE_PREFIX: &str = "org.freedesktop.systemd1.";

/// A dynamically typed property value read from the manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    /// Strings, object paths and signatures
    Str(String),
    /// Arrays and structures
    Seq(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PropertyValue::UInt(n) => Some(*n),
            PropertyValue::Int(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }
}

impl TryFrom<&Value<'_>> for PropertyValue {
    type Error = String;

    fn try_from(value: &Value<'_>) -> std::result::Result<Self, Self::Error> {
        let converted = match value {
            Value::Bool(b) => PropertyValue::Bool(*b),
            Value::U8(n) => PropertyValue::UInt(u64::from(*n)),
            Value::U16(n) => PropertyValue::UInt(u64::from(*n)),
            Value::U32(n) => PropertyValue::UInt(u64::from(*n)),
            Value::U64(n) => PropertyValue::UInt(*n),
            Value::I16(n) => PropertyValue::Int(i64::from(*n)),
            Value::I32(n) => PropertyValue::Int(i64::from(*n)),
            Value::I64(n) => PropertyValue::Int(*n),
            Value::F64(n) => PropertyValue::Double(*n),
            Value::Str(s) => PropertyValue::Str(s.as_str().to_string()),
            Value::ObjectPath(p) => PropertyValue::Str(p.as_str().to_string()),
            Value::Signature(s) => PropertyValue::Str(s.to_string()),
            Value::Value(inner) => PropertyValue::try_from(&**inner)?,
            Value::Array(array) => PropertyValue::Seq(
                array
                    .iter()
                    .map(PropertyValue::try_from)
                    .collect::<std::result::Result<_, _>>()?,
            ),
            Value::Structure(structure) => PropertyValue::Seq(
                structure
                    .fields()
                    .iter()
                    .map(PropertyValue::try_from)
                    .collect::<std::result::Result<_, _>>()?,
            ),
            Value::Dict(dict) => {
                let mut map = BTreeMap::new();
                for (key, value) in dict.iter() {
                    map.insert(
                        PropertyValue::try_from(key)?.to_string(),
                        PropertyValue::try_from(value)?,
                    );
                }
                PropertyValue::Map(map)
            }
            other => return Err(format!("unsupported value {:?}", other)),
        };
        Ok(converted)
    }
}

impl fmt::Display for PropertyValue {
    /// Renders the way `systemctl show` does: booleans as yes/no, lists
    /// space separated.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => f.write_str(if *b { "yes" } else { "no" }),
            PropertyValue::Int(n) => write!(f, "{}", n),
            PropertyValue::UInt(n) => write!(f, "{}", n),
            PropertyValue::Double(n) => write!(f, "{}", n),
            PropertyValue::Str(s) => f.write_str(s),
            PropertyValue::Seq(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
            PropertyValue::Map(map) => {
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}={}", key, value)?;
                }
                Ok(())
            }
        }
    }
}

/// A named property read from a unit or the manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Property {
    pub name: String,
    pub value: PropertyValue,
}

/// A property to write with `SetUnitProperties` or `StartTransientUnit`.
#[derive(Debug, Serialize, Type)]
pub struct UnitProperty {
    pub name: String,
    pub value: Value<'static>,
}

impl UnitProperty {
    pub fn new(name: impl Into<String>, value: impl Into<Value<'static>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// `ExecStart`: run `argv` with `path` as the executable.
    ///
    /// With `ignore_failure`, a non-zero exit is not treated as a failure.
    pub fn exec_start(path: impl Into<String>, argv: Vec<String>, ignore_failure: bool) -> Self {
        let path: String = path.into();
        Self::new("ExecStart", Value::from(vec![(path, argv, ignore_failure)]))
    }

    pub fn description(description: &str) -> Self {
        Self::new("Description", description.to_string())
    }

    pub fn remain_after_exit(remain: bool) -> Self {
        Self::new("RemainAfterExit", remain)
    }

    /// Service `Type=` (`simple`, `oneshot`, `forking`, ...).
    pub fn service_type(kind: &str) -> Self {
        Self::new("Type", kind.to_string())
    }

    pub fn slice(slice: &str) -> Self {
        Self::new("Slice", slice.to_string())
    }

    /// Move existing processes into a transient scope.
    pub fn pids(pids: Vec<u32>) -> Self {
        Self::new("PIDs", Value::from(pids))
    }

    fn units(name: &str, units: Vec<String>) -> Self {
        Self::new(name, Value::from(units))
    }

    pub fn requires(units: Vec<String>) -> Self {
        Self::units("Requires", units)
    }

    pub fn wants(units: Vec<String>) -> Self {
        Self::units("Wants", units)
    }

    pub fn binds_to(units: Vec<String>) -> Self {
        Self::units("BindsTo", units)
    }

    pub fn part_of(units: Vec<String>) -> Self {
        Self::units("PartOf", units)
    }

    pub fn conflicts(units: Vec<String>) -> Self {
        Self::units("Conflicts", units)
    }

    pub fn before(units: Vec<String>) -> Self {
        Self::units("Before", units)
    }

    pub fn after(units: Vec<String>) -> Self {
        Self::units("After", units)
    }

    /// Parse a `NAME=VALUE` assignment.
    ///
    /// `yes`/`no`/`true`/`false` become booleans, unsigned integers become
    /// `t`, anything else a string.
    pub fn parse_assignment(assignment: &str) -> Option<Self> {
        let (name, raw) = assignment.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let value = match raw {
            "yes" | "true" => Value::from(true),
            "no" | "false" => Value::from(false),
            _ => match raw.parse::<u64>() {
                Ok(n) => Value::from(n),
                Err(_) => Value::from(raw.to_string()),
            },
        };
        Some(Self::new(name, value))
    }
}

fn decode_value(method: Method, name: &str, value: &OwnedValue) -> Result<PropertyValue> {
    PropertyValue::try_from(&**value)
        .map_err(|reason| ManagerError::decoding(method, format!("property {}: {}", name, reason)))
}

impl<T: Transport> ManagerClient<T> {
    async fn get_properties(
        &self,
        ctx: &CallContext,
        path: &ObjectPath<'_>,
        interface: &str,
    ) -> Result<HashMap<String, PropertyValue>> {
        let method = methods::GET_ALL_PROPERTIES;
        let raw: HashMap<String, OwnedValue> = self.call(ctx, path, method, &(interface,)).await?;

        raw.iter()
            .map(|(name, value)| Ok((name.clone(), decode_value(method, name, value)?)))
            .collect()
    }

    async fn get_property_at(
        &self,
        ctx: &CallContext,
        path: &ObjectPath<'_>,
        interface: &str,
        name: &str,
    ) -> Result<Property> {
        let method = methods::GET_PROPERTY;
        let raw: OwnedValue = self.call(ctx, path, method, &(interface, name)).await?;
        Ok(Property {
            name: name.to_string(),
            value: decode_value(method, name, &raw)?,
        })
    }

    /// Read one property of `unit` from `interface`.
    ///
    /// Fails with [`ManagerError::InvalidIdentifier`] before any call is made
    /// when `unit` is not a valid unit name.
    pub async fn get_property(
        &self,
        ctx: &CallContext,
        unit: &str,
        interface: &str,
        name: &str,
    ) -> Result<Property> {
        let path = unit_path(unit)?;
        self.get_property_at(ctx, &path, interface, name).await
    }

    /// Properties of the `Unit` interface.
    pub async fn get_unit_properties(
        &self,
        ctx: &CallContext,
        unit: &str,
    ) -> Result<HashMap<String, PropertyValue>> {
        let path = unit_path(unit)?;
        self.get_properties(ctx, &path, UNIT_INTERFACE).await
    }

    /// Properties of the `Unit` interface, addressed by object path.
    pub async fn get_unit_path_properties(
        &self,
        ctx: &CallContext,
        path: &str,
    ) -> Result<HashMap<String, PropertyValue>> {
        let path = parse_object_path(path)?;
        self.get_properties(ctx, &path, UNIT_INTERFACE).await
    }

    /// Properties of every interface the unit implements.
    pub async fn get_all_properties(
        &self,
        ctx: &CallContext,
        unit: &str,
    ) -> Result<HashMap<String, PropertyValue>> {
        let path = unit_path(unit)?;
        self.get_properties(ctx, &path, "").await
    }

    /// Properties specific to a unit type, e.g. `Service` or `Timer`.
    ///
    /// Asking for the wrong type fails with the manager's "Unknown interface"
    /// error.
    pub async fn get_unit_type_properties(
        &self,
        ctx: &CallContext,
        unit: &str,
        unit_type: &str,
    ) -> Result<HashMap<String, PropertyValue>> {
        let path = unit_path(unit)?;
        let interface = format!("{}{}", UNIT_TYPE_INTERFACE_PREFIX, unit_type);
        self.get_properties(ctx, &path, &interface).await
    }

    pub async fn get_unit_property(
        &self,
        ctx: &CallContext,
        unit: &str,
        name: &str,
    ) -> Result<Property> {
        self.get_property(ctx, unit, UNIT_INTERFACE, name).await
    }

    pub async fn get_service_property(
        &self,
        ctx: &CallContext,
        service: &str,
        name: &str,
    ) -> Result<Property> {
        let interface = format!("{}Service", UNIT_TYPE_INTERFACE_PREFIX);
        self.get_property(ctx, service, &interface, name).await
    }

    pub async fn get_unit_type_property(
        &self,
        ctx: &CallContext,
        unit: &str,
        unit_type: &str,
        name: &str,
    ) -> Result<Property> {
        let interface = format!("{}{}", UNIT_TYPE_INTERFACE_PREFIX, unit_type);
        self.get_property(ctx, unit, &interface, name).await
    }

    /// The manager's `SystemState` (`running`, `degraded`, ...).
    pub async fn system_state(&self, ctx: &CallContext) -> Result<Property> {
        self.get_property_at(
            ctx,
            self.manager_path(),
            methods::MANAGER_INTERFACE,
            "SystemState",
        )
        .await
    }

    /// Change properties of a loaded unit.
    ///
    /// With `runtime` the change lasts until the manager restarts, otherwise
    /// it is persisted to the unit's drop-in configuration.
    pub async fn set_unit_properties(
        &self,
        ctx: &CallContext,
        name: &str,
        runtime: bool,
        properties: &[UnitProperty],
    ) -> Result<()> {
        validate_unit_name(name)?;
        self.call(
            ctx,
            self.manager_path(),
            methods::SET_UNIT_PROPERTIES,
            &(name, runtime, properties),
        )
        .await
    }
}

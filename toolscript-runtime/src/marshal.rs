//! Value marshaling across the sandbox boundary
//!
//! Both directions walk the value recursively and keep a stack of the
//! objects currently being visited. Meeting an ancestor again is a cycle and
//! becomes [`CIRCULAR_SENTINEL`]; meeting an object that was already
//! finished elsewhere in the walk is only a shared reference and converts
//! normally.
//!
//! Guest to host: dates become ISO strings, functions and symbols become
//! [`Value::Unserializable`], bigints keep full precision and `undefined`
//! members stay present.
//!
//! Host to guest: [`Value::Shared`] allocations keep their identity, so a
//! sub-object referenced twice is the same guest object twice.

use num_bigint::BigInt;
use once_cell::unsync::OnceCell;
use rquickjs::{Array, Ctx, Exception, Function, IntoJs, Object, Type, Value as JsValue};
use std::collections::HashMap;
use toolscript_types::{UnserializableKind, Value, CIRCULAR_SENTINEL, UNSERIALIZABLE_TAG};

const MAX_DEPTH: usize = 256;

const HELPERS: &str = r#"({
  dateIso(v) {
    if (!(v instanceof Date)) return undefined;
    return isNaN(v.getTime()) ? null : v.toISOString();
  },
  bigintText(v) { return v.toString(); },
  bigint(text) { return BigInt(text); },
})"#;

/// Converter bound to one guest context
pub(crate) struct Marshal<'js> {
    ctx: Ctx<'js>,
    helpers: OnceCell<Object<'js>>,
}

impl<'js> Marshal<'js> {
    pub fn new(ctx: &Ctx<'js>) -> Self {
        Self {
            ctx: ctx.clone(),
            helpers: OnceCell::new(),
        }
    }

    fn helper(&self, name: &str) -> rquickjs::Result<Function<'js>> {
        self.helpers
            .get_or_try_init(|| self.ctx.eval::<Object<'js>, _>(HELPERS))?
            .get(name)
    }

    fn too_deep(&self) -> rquickjs::Error {
        Exception::throw_range(&self.ctx, "Value is nested too deeply to marshal")
    }

    // ========================================================================
    // Guest to host
    // ========================================================================

    pub fn to_host(&self, value: &JsValue<'js>) -> rquickjs::Result<Value> {
        let mut ancestors = Vec::new();
        self.host_value(value, &mut ancestors)
    }

    fn host_value(
        &self,
        value: &JsValue<'js>,
        ancestors: &mut Vec<Object<'js>>,
    ) -> rquickjs::Result<Value> {
        let converted = match value.type_of() {
            Type::Uninitialized | Type::Undefined => Value::Undefined,
            Type::Null => Value::Null,
            Type::Bool => Value::Bool(value.as_bool().unwrap_or_default()),
            Type::Int => Value::Number(value.as_int().map(f64::from).unwrap_or_default()),
            Type::Float => Value::Number(value.as_float().unwrap_or(f64::NAN)),
            Type::String => match value.as_string() {
                Some(text) => Value::String(text.to_string()?),
                None => Value::Undefined,
            },
            Type::BigInt => {
                let text: String = self.helper("bigintText")?.call((value.clone(),))?;
                match text.parse::<BigInt>() {
                    Ok(n) => Value::BigInt(n),
                    Err(_) => return Err(Exception::throw_type(&self.ctx, "Malformed BigInt")),
                }
            }
            Type::Symbol => Value::Unserializable(UnserializableKind::Symbol),
            Type::Function | Type::Constructor => {
                Value::Unserializable(UnserializableKind::Function)
            }
            _ => match value.as_object() {
                Some(object) => self.host_composite(value, object, ancestors)?,
                None => Value::Undefined,
            },
        };
        Ok(converted)
    }

    fn host_composite(
        &self,
        value: &JsValue<'js>,
        object: &Object<'js>,
        ancestors: &mut Vec<Object<'js>>,
    ) -> rquickjs::Result<Value> {
        if ancestors.iter().any(|ancestor| ancestor == object) {
            return Ok(Value::String(CIRCULAR_SENTINEL.to_string()));
        }
        if ancestors.len() >= MAX_DEPTH {
            return Err(self.too_deep());
        }

        ancestors.push(object.clone());
        let converted = match value.as_array() {
            Some(array) => self.host_array(array, ancestors),
            None => self.host_object(object, ancestors),
        };
        ancestors.pop();
        converted
    }

    fn host_array(
        &self,
        array: &Array<'js>,
        ancestors: &mut Vec<Object<'js>>,
    ) -> rquickjs::Result<Value> {
        let mut items = Vec::with_capacity(array.len());
        for index in 0..array.len() {
            let item: JsValue<'js> = array.get(index)?;
            items.push(self.host_value(&item, ancestors)?);
        }
        Ok(Value::Array(items))
    }

    fn host_object(
        &self,
        object: &Object<'js>,
        ancestors: &mut Vec<Object<'js>>,
    ) -> rquickjs::Result<Value> {
        let iso: JsValue<'js> = self.helper("dateIso")?.call((object.clone(),))?;
        if let Some(text) = iso.as_string() {
            return Ok(Value::Date(text.to_string()?));
        }
        // Invalid dates serialize as null.
        if iso.is_null() {
            return Ok(Value::Null);
        }

        let mut members = Vec::new();
        for key in object.keys::<String>() {
            let key = key?;
            let member: JsValue<'js> = object.get(key.as_str())?;
            let member = self.host_value(&member, ancestors)?;
            members.push((key, member));
        }
        Ok(Value::Object(members))
    }

    // ========================================================================
    // Host to guest
    // ========================================================================

    pub fn to_guest(&self, value: &Value) -> rquickjs::Result<JsValue<'js>> {
        let mut ancestors = Vec::new();
        let mut finished = HashMap::new();
        self.guest_value(value, &mut ancestors, &mut finished, 0)
    }

    fn guest_value(
        &self,
        value: &Value,
        ancestors: &mut Vec<usize>,
        finished: &mut HashMap<usize, JsValue<'js>>,
        depth: usize,
    ) -> rquickjs::Result<JsValue<'js>> {
        if depth > MAX_DEPTH {
            return Err(self.too_deep());
        }
        let ctx = &self.ctx;
        match value {
            Value::Undefined => Ok(JsValue::new_undefined(ctx.clone())),
            Value::Null => Ok(JsValue::new_null(ctx.clone())),
            Value::Bool(b) => b.into_js(ctx),
            Value::Number(n) => n.into_js(ctx),
            Value::BigInt(n) => self.helper("bigint")?.call((n.to_string(),)),
            Value::String(text) | Value::Date(text) => text.as_str().into_js(ctx),
            Value::Array(items) => {
                let array = Array::new(ctx.clone())?;
                for (index, item) in items.iter().enumerate() {
                    array.set(index, self.guest_value(item, ancestors, finished, depth + 1)?)?;
                }
                Ok(array.into_value())
            }
            Value::Object(members) => {
                let object = Object::new(ctx.clone())?;
                for (key, member) in members {
                    object.set(
                        key.as_str(),
                        self.guest_value(member, ancestors, finished, depth + 1)?,
                    )?;
                }
                Ok(object.into_value())
            }
            Value::Unserializable(kind) => {
                let placeholder = Object::new(ctx.clone())?;
                placeholder.set(UNSERIALIZABLE_TAG, kind.as_str())?;
                Ok(placeholder.into_value())
            }
            Value::Shared(shared) => {
                let id = shared.id();
                if ancestors.contains(&id) {
                    return CIRCULAR_SENTINEL.into_js(ctx);
                }
                if let Some(existing) = finished.get(&id) {
                    return Ok(existing.clone());
                }
                // Snapshot so the lock is not held across the recursive walk.
                let inner = shared.read().clone();
                ancestors.push(id);
                let converted = self.guest_value(&inner, ancestors, finished, depth + 1);
                ancestors.pop();
                let converted = converted?;
                finished.insert(id, converted.clone());
                Ok(converted)
            }
        }
    }
}

use rquickjs::{Array, Ctx, IntoJs, Object, Value};

const MAX_DEPTH: usize = 64;

pub fn json_to_js<'js>(ctx: &Ctx<'js>, value: &serde_json::Value) -> rquickjs::Result<Value<'js>> {
    match value {
        serde_json::Value::Null => Ok(Value::new_null(ctx.clone())),
        serde_json::Value::Bool(b) => Ok(Value::new_bool(ctx.clone(), *b)),
        serde_json::Value::Number(n) => n.as_i64().and_then(|i| i32::try_from(i).ok()).map_or_else(
            || {
                n.as_f64().map_or_else(
                    || Ok(Value::new_null(ctx.clone())),
                    |f| Ok(Value::new_float(ctx.clone(), f)),
                )
            },
            |i| Ok(Value::new_int(ctx.clone(), i)),
        ),
        serde_json::Value::String(s) => s.clone().into_js(ctx),
        serde_json::Value::Array(items) => {
            let array = Array::new(ctx.clone())?;
            for (index, item) in items.iter().enumerate() {
                array.set(index, json_to_js(ctx, item)?)?;
            }
            Ok(array.into_value())
        }
        serde_json::Value::Object(map) => {
            let object = Object::new(ctx.clone())?;
            for (key, item) in map {
                object.set(key.as_str(), json_to_js(ctx, item)?)?;
            }
            Ok(object.into_value())
        }
    }
}

/// Convert a JS value into JSON. Functions and symbols are dropped from
/// objects, as `JSON.stringify` does; nesting deeper than 64 levels becomes
/// `null`.
pub fn js_to_json(value: &Value<'_>) -> rquickjs::Result<serde_json::Value> {
    js_to_json_at(value, 0)
}

fn js_to_json_at(value: &Value<'_>, depth: usize) -> rquickjs::Result<serde_json::Value> {
    if depth > MAX_DEPTH || value.is_null() || value.is_undefined() {
        return Ok(serde_json::Value::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(serde_json::Value::Bool(b));
    }
    if let Some(i) = value.as_int() {
        return Ok(serde_json::json!(i));
    }
    if let Some(f) = value.as_float() {
        return Ok(serde_json::json!(f));
    }
    if let Some(s) = value.as_string() {
        return Ok(serde_json::Value::String(s.to_string()?));
    }
    if let Some(array) = value.as_array() {
        let mut items = Vec::with_capacity(array.len());
        for index in 0..array.len() {
            let item: Value<'_> = array.get(index)?;
            items.push(js_to_json_at(&item, depth + 1)?);
        }
        return Ok(serde_json::Value::Array(items));
    }
    if value.is_function() {
        return Ok(serde_json::Value::Null);
    }
    if let Some(object) = value.as_object() {
        let mut map = serde_json::Map::new();
        for entry in object.props::<String, Value<'_>>() {
            let (key, item) = entry?;
            if item.is_function() || item.is_symbol() || item.is_undefined() {
                continue;
            }
            map.insert(key, js_to_json_at(&item, depth + 1)?);
        }
        return Ok(serde_json::Value::Object(map));
    }
    Ok(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    #[test]
    fn json_survives_a_trip_through_the_engine() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let input = serde_json::json!({"name": "app", "port": 8080, "ratio": 0.5, "tags": ["a", "b"], "nested": {"ok": true}});
        let output = context
            .with(|ctx| {
                let value = json_to_js(&ctx, &input)?;
                js_to_json(&value)
            })
            .unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn functions_are_dropped_from_objects() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let output = context
            .with(|ctx| {
                let value: Value = ctx.eval("({ x: 1, run() {}, skip: undefined })")?;
                js_to_json(&value)
            })
            .unwrap();
        assert_eq!(output, serde_json::json!({"x": 1}));
    }
}

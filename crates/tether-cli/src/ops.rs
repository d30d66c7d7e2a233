//! Operations served by `tether serve`.

use serde_json::Value;
use tether_wire::Server;

/// Operation names, in registration order.
pub const OPERATIONS: &[&str] = &["add", "subtract", "multiply", "divide", "echo"];

/// Register every operation on `server`.
pub fn register(server: &Server) {
    server.handle("add", |args: Vec<Value>| async move { add(&args) });
    server.handle("subtract", |args: Vec<Value>| async move { subtract(&args) });
    server.handle("multiply", |args: Vec<Value>| async move { multiply(&args) });
    server.handle("divide", |args: Vec<Value>| async move { divide(&args) });
    server.handle("echo", |args: Vec<Value>| async move { Ok::<_, String>(echo(args)) });
}

fn numbers(args: &[Value]) -> Result<Vec<f64>, String> {
    args.iter()
        .enumerate()
        .map(|(i, v)| {
            v.as_f64()
                .ok_or_else(|| format!("argument {i} is not a number: {v}"))
        })
        .collect()
}

fn pair(args: &[Value]) -> Result<(f64, f64), String> {
    match numbers(args)?.as_slice() {
        [a, b] => Ok((*a, *b)),
        other => Err(format!("expected 2 arguments, got {}", other.len())),
    }
}

/// Integers stay integers when the result is exact.
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}

fn add(args: &[Value]) -> Result<Value, String> {
    Ok(number(numbers(args)?.into_iter().sum()))
}

fn subtract(args: &[Value]) -> Result<Value, String> {
    let (a, b) = pair(args)?;
    Ok(number(a - b))
}

fn multiply(args: &[Value]) -> Result<Value, String> {
    Ok(number(numbers(args)?.into_iter().product()))
}

fn divide(args: &[Value]) -> Result<Value, String> {
    let (a, b) = pair(args)?;
    if b == 0.0 {
        return Err("division by zero".to_string());
    }
    Ok(number(a / b))
}

/// A single argument comes back as itself, several as an array.
fn echo(mut args: Vec<Value>) -> Value {
    match args.len() {
        0 => Value::Null,
        1 => args.remove(0),
        _ => Value::Array(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_arithmetic() {
        assert_eq!(add(&[json!(2), json!(3), json!(4)]).unwrap(), json!(9));
        assert_eq!(add(&[]).unwrap(), json!(0));
        assert_eq!(subtract(&[json!(10), json!(4)]).unwrap(), json!(6));
        assert_eq!(multiply(&[json!(2), json!(3)]).unwrap(), json!(6));
        assert_eq!(divide(&[json!(7), json!(2)]).unwrap(), json!(3.5));
        assert_eq!(add(&[json!(0.5), json!(0.25)]).unwrap(), json!(0.75));
    }

    #[test]
    fn test_errors_are_descriptive() {
        assert_eq!(
            divide(&[json!(1), json!(0)]).unwrap_err(),
            "division by zero"
        );
        assert!(subtract(&[json!(1)]).unwrap_err().contains("expected 2"));
        assert!(add(&[json!("x")]).unwrap_err().contains("argument 0"));
    }

    #[test]
    fn test_echo_shapes() {
        assert_eq!(echo(vec![]), Value::Null);
        assert_eq!(echo(vec![json!({"a": 1})]), json!({"a": 1}));
        assert_eq!(echo(vec![json!(1), json!("b")]), json!([1, "b"]));
    }

    #[tokio::test]
    async fn test_registered_on_server() {
        let server = Server::builder(Default::default())
            .listener(tether_wire::MemoryHub::new().listener())
            .build()
            .unwrap();
        register(&server);
        let mut expected: Vec<&str> = OPERATIONS.to_vec();
        expected.sort_unstable();
        assert_eq!(server.operations(), expected);
    }
}

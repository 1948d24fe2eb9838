//! Overload resolution and invocation of guest methods.

use std::{any::Any, fmt, panic::AssertUnwindSafe, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    error::{BindingError, Error, Result},
    value::ValueKind,
};

/// Error raised by guest code.
///
/// `guest_type` identifies the error the way the guest names it; it travels
/// to the host unchanged inside [`Error::GuestFault`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{guest_type}] {message}")]
pub struct GuestError {
    pub guest_type: String,
    pub message: String,
}

impl GuestError {
    pub fn new(guest_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            guest_type: guest_type.into(),
            message: message.into(),
        }
    }

    /// Wraps any error, naming it by its Rust type.
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        Self::new(std::any::type_name::<E>(), err.to_string())
    }
}

impl From<Error> for GuestError {
    fn from(value: Error) -> Self {
        match value {
            Error::GuestFault {
                guest_type,
                message,
            } => Self::new(guest_type, message),
            other => Self::new(format!("sandy::{}", other.kind()), other.to_string()),
        }
    }
}

impl From<GuestError> for Error {
    fn from(value: GuestError) -> Self {
        Self::GuestFault {
            guest_type: value.guest_type,
            message: value.message,
        }
    }
}

macro_rules! guest_error_from {
    ($($ty:ty),* $(,)?) => {
        $(impl From<$ty> for GuestError {
            fn from(value: $ty) -> Self {
                Self::from_error(&value)
            }
        })*
    };
}

guest_error_from!(
    serde_json::Error,
    std::io::Error,
    std::num::ParseIntError,
    std::num::ParseFloatError,
    std::num::TryFromIntError,
);

/// Declared type of a guest method parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    Any,
    Bool,
    Int,
    Float,
    Char,
    String,
    Date,
    TimeSpan,
    Uri,
    Guid,
    Enum,
    Array,
    Object,
    Nullable(Box<ParamType>),
}

impl ParamType {
    pub fn nullable(inner: Self) -> Self {
        Self::Nullable(Box::new(inner))
    }

    /// Kind-level compatibility used during overload resolution.
    pub fn accepts(&self, kind: ValueKind) -> bool {
        match (self, kind) {
            (Self::Any, _) => true,
            (Self::Nullable(inner), kind) => kind == ValueKind::Null || inner.accepts(kind),
            (_, ValueKind::Null) => self.is_reference(),
            (Self::Bool, ValueKind::Boolean)
            | (Self::Int | Self::Float, ValueKind::Integer | ValueKind::Float)
            | (Self::Enum, ValueKind::Integer)
            | (
                Self::String | Self::Char | Self::Date | Self::TimeSpan | Self::Uri | Self::Guid,
                ValueKind::String,
            )
            | (Self::Array | Self::Object, ValueKind::Array)
            | (Self::Object, ValueKind::Object) => true,
            _ => false,
        }
    }

    const fn is_reference(&self) -> bool {
        matches!(self, Self::String | Self::Uri | Self::Array | Self::Object)
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn coerce(&self, name: &str, value: Value) -> Result<Value, BindingError> {
        match (self, value) {
            (Self::Nullable(_), Value::Null) => Ok(Value::Null),
            (Self::Nullable(inner), value) => inner.coerce(name, value),
            (Self::Float, Value::Number(n)) if !n.is_f64() => n
                .as_f64()
                .map(Value::from)
                .ok_or_else(|| BindingError::argument_mismatch(name, "not representable as a float")),
            (Self::Int, Value::Number(n)) if n.is_f64() => {
                let float = n.as_f64().unwrap_or(f64::NAN).round_ties_even();
                if float.is_finite() && float >= i64::MIN as f64 && float < i64::MAX as f64 {
                    Ok(Value::from(float as i64))
                } else {
                    Err(BindingError::argument_mismatch(
                        name,
                        format!("{n} is out of range for an integer"),
                    ))
                }
            }
            (Self::Char, Value::String(s)) => {
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(_), None) => Ok(Value::String(s)),
                    _ => Err(BindingError::argument_mismatch(
                        name,
                        format!("expected a single character, got {s:?}"),
                    )),
                }
            }
            (_, value) => Ok(value),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nullable(inner) => write!(f, "{inner}?"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub ty: ParamType,
    /// Value used when the caller omits an optional parameter.
    pub default: Option<Value>,
}

/// A bound argument: either a supplied value or "use the declared default".
#[derive(Debug, Clone, PartialEq)]
pub enum BoundArg {
    Value(Value),
    UseDefault,
}

/// Arguments handed to a guest method, in declaration order.
#[derive(Debug, Clone)]
pub struct Args {
    values: Vec<BoundArg>,
    params: Arc<[Parameter]>,
}

impl Args {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn raw(&self) -> &[BoundArg] {
        &self.values
    }

    pub fn is_default(&self, index: usize) -> bool {
        matches!(self.values.get(index), Some(BoundArg::UseDefault))
    }

    /// Argument at `index`, with defaults resolved.
    pub fn value(&self, index: usize) -> Result<Value, GuestError> {
        match self.values.get(index) {
            Some(BoundArg::Value(value)) => Ok(value.clone()),
            Some(BoundArg::UseDefault) => Ok(self.params[index].default.clone().unwrap_or_default()),
            None => Err(GuestError::new(
                "sandy::ArgumentError",
                format!("no argument at position {index}"),
            )),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, GuestError> {
        serde_json::from_value(self.value(index)?).map_err(|err| {
            GuestError::new(
                "sandy::ArgumentError",
                format!("argument `{}`: {err}", self.params[index].name),
            )
        })
    }
}

pub type GuestFuture = BoxFuture<'static, Result<Value, GuestError>>;

/// What a guest handler produced: a value now, or a value later.
pub enum Outcome {
    Ready(Value),
    Deferred(GuestFuture),
}

pub(crate) type GuestFn = Arc<dyn Fn(Args) -> Result<Outcome, GuestError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Returns {
    Value,
    Void,
}

/// One overload of a guest method.
#[derive(Clone)]
pub struct Candidate {
    name: String,
    params: Arc<[Parameter]>,
    returns: Returns,
    handler: GuestFn,
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature())
    }
}

impl Candidate {
    pub(crate) fn new(
        name: String,
        params: Vec<Parameter>,
        returns: Returns,
        handler: GuestFn,
    ) -> Self {
        Self {
            name,
            params: params.into(),
            returns,
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    pub const fn returns(&self) -> Returns {
        self.returns
    }

    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| match p.default {
                Some(_) => format!("{}: {} = ..", p.name, p.ty),
                None => format!("{}: {}", p.name, p.ty),
            })
            .collect();
        format!("{}({})", self.name, params.join(", "))
    }

    fn matches(&self, positional: &[Value], named: &Map<String, Value>) -> bool {
        if positional.len() > self.params.len() {
            return false;
        }
        let positional_ok = self
            .params
            .iter()
            .zip(positional)
            .all(|(p, v)| p.ty.accepts(ValueKind::of(v)));
        if !positional_ok {
            return false;
        }

        let mut consumed = 0;
        for param in &self.params[positional.len()..] {
            match named.get(&param.name) {
                Some(value) if param.ty.accepts(ValueKind::of(value)) => consumed += 1,
                Some(_) => return false,
                None if param.default.is_some() => {}
                None => return false,
            }
        }
        consumed == named.len()
    }

    fn bind_args(&self, positional: &[Value], named: &Map<String, Value>) -> Result<Args, BindingError> {
        let values = self
            .params
            .iter()
            .enumerate()
            .map(|(index, param)| {
                let supplied = positional.get(index).or_else(|| named.get(&param.name));
                match supplied {
                    Some(value) => param.ty.coerce(&param.name, value.clone()).map(BoundArg::Value),
                    None => Ok(BoundArg::UseDefault),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Args {
            values,
            params: Arc::clone(&self.params),
        })
    }
}

/// Picks the single overload accepting the arguments and binds them.
pub fn bind<'a>(
    module: &str,
    method: &str,
    candidates: &'a [Candidate],
    positional: &[Value],
    named: &Map<String, Value>,
) -> Result<(&'a Candidate, Args), BindingError> {
    let matching: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| c.matches(positional, named))
        .collect();
    match matching.as_slice() {
        [] => Err(BindingError::missing_method(module, method)),
        [candidate] => Ok((candidate, candidate.bind_args(positional, named)?)),
        many => Err(BindingError::ambiguous_match(
            module,
            method,
            &many.iter().map(|c| c.signature()).collect::<Vec<_>>(),
        )),
    }
}

/// Runs a bound overload, awaiting deferred results and converting panics
/// into guest faults.
pub async fn invoke(candidate: &Candidate, args: Args) -> Result<Value> {
    let handler = Arc::clone(&candidate.handler);
    let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(args))) {
        Ok(outcome) => outcome?,
        Err(panic) => return Err(panic_fault(&*panic)),
    };
    let value = match outcome {
        Outcome::Ready(value) => value,
        Outcome::Deferred(future) => match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result?,
            Err(panic) => return Err(panic_fault(&*panic)),
        },
    };
    Ok(match candidate.returns {
        Returns::Value => value,
        Returns::Void => Value::Null,
    })
}

fn panic_fault(panic: &(dyn Any + Send)) -> Error {
    let message = panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "guest method panicked".to_string());
    Error::GuestFault {
        guest_type: "panic".to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn candidate(name: &str, params: Vec<Parameter>) -> Candidate {
        let name_owned = name.to_string();
        Candidate::new(
            name.to_string(),
            params,
            Returns::Value,
            Arc::new(move |_: Args| -> Result<Outcome, GuestError> {
                Ok(Outcome::Ready(json!(name_owned.clone())))
            }),
        )
    }

    fn param(name: &str, ty: ParamType) -> Parameter {
        Parameter {
            name: name.to_string(),
            ty,
            default: None,
        }
    }

    fn add_overloads() -> Vec<Candidate> {
        vec![
            candidate(
                "AddFloat",
                vec![param("x", ParamType::Float), param("y", ParamType::Float)],
            ),
            candidate(
                "AddString",
                vec![param("x", ParamType::String), param("y", ParamType::String)],
            ),
        ]
    }

    fn resolve(candidates: &[Candidate], positional: &[Value]) -> Result<String, BindingError> {
        bind("Calc", "Add", candidates, positional, &Map::new()).map(|(c, _)| c.name().to_string())
    }

    #[test]
    fn compatibility_table() {
        use ValueKind as K;
        assert!(ParamType::String.accepts(K::Null));
        assert!(ParamType::Array.accepts(K::Null));
        assert!(!ParamType::Int.accepts(K::Null));
        assert!(ParamType::nullable(ParamType::Int).accepts(K::Null));
        assert!(ParamType::Int.accepts(K::Float));
        assert!(ParamType::Float.accepts(K::Integer));
        assert!(ParamType::Enum.accepts(K::Integer));
        assert!(!ParamType::Enum.accepts(K::Float));
        assert!(ParamType::Guid.accepts(K::String));
        assert!(!ParamType::String.accepts(K::Integer));
        assert!(!ParamType::Array.accepts(K::Object));
        assert!(ParamType::Object.accepts(K::Array));
        assert!(!ParamType::Object.accepts(K::String));
        assert!(ParamType::Any.accepts(K::Object));
    }

    #[test]
    fn object_parameters_bind_arrays() {
        let take = vec![candidate("Take", vec![param("o", ParamType::Object)])];
        let (_, args) = bind("M", "Take", &take, &[json!([1, 2])], &Map::new()).unwrap();
        assert_eq!(args.value(0).unwrap(), json!([1, 2]));
        let (_, args) = bind("M", "Take", &take, &[json!({"a": 1})], &Map::new()).unwrap();
        assert_eq!(args.value(0).unwrap(), json!({"a": 1}));
        let err = bind("M", "Take", &take, &[json!(1)], &Map::new()).unwrap_err();
        assert!(matches!(err, BindingError::MissingMethod(_)));
    }

    #[test]
    fn picks_overload_by_argument_kind() {
        let candidates = add_overloads();
        assert_eq!(resolve(&candidates, &[json!(10.23), json!(20.45)]).unwrap(), "AddFloat");
        assert_eq!(resolve(&candidates, &[json!("abc"), json!("ABC")]).unwrap(), "AddString");
    }

    #[test]
    fn null_for_value_parameter_is_missing_method() {
        let err = resolve(&add_overloads(), &[json!(10), Value::Null]).unwrap_err();
        assert!(matches!(err, BindingError::MissingMethod(_)));
    }

    #[test]
    fn null_matching_two_reference_overloads_is_ambiguous() {
        let candidates = vec![
            candidate("Text", vec![param("x", ParamType::String)]),
            candidate("List", vec![param("x", ParamType::Array)]),
        ];
        let err = resolve(&candidates, &[Value::Null]).unwrap_err();
        assert!(matches!(err, BindingError::AmbiguousMatch(_)));
    }

    #[test]
    fn too_many_positional_arguments_do_not_match() {
        let err = resolve(&add_overloads(), &[json!(1), json!(2), json!(3)]).unwrap_err();
        assert!(matches!(err, BindingError::MissingMethod(_)));
    }

    #[test]
    fn named_and_default_arguments() {
        let candidates = vec![candidate(
            "Greet",
            vec![
                param("name", ParamType::String),
                Parameter {
                    name: "greeting".into(),
                    ty: ParamType::String,
                    default: Some(json!("Hello")),
                },
            ],
        )];

        let named = Map::new();
        let (_, args) = bind("M", "Greet", &candidates, &[json!("Ada")], &named).unwrap();
        assert!(args.is_default(1));
        assert_eq!(args.value(1).unwrap(), json!("Hello"));

        let mut named = Map::new();
        named.insert("greeting".into(), json!("Hi"));
        let (_, args) = bind("M", "Greet", &candidates, &[json!("Ada")], &named).unwrap();
        assert_eq!(args.get::<String>(1).unwrap(), "Hi");

        named.insert("unknown".into(), json!(1));
        let err = bind("M", "Greet", &candidates, &[json!("Ada")], &named).unwrap_err();
        assert!(matches!(err, BindingError::MissingMethod(_)));
    }

    #[test]
    fn numeric_coercion() {
        let ints = vec![candidate("Int", vec![param("x", ParamType::Int)])];
        let (_, args) = bind("M", "Int", &ints, &[json!(2.5)], &Map::new()).unwrap();
        assert_eq!(args.value(0).unwrap(), json!(2));
        let (_, args) = bind("M", "Int", &ints, &[json!(3.5)], &Map::new()).unwrap();
        assert_eq!(args.value(0).unwrap(), json!(4));
        let err = bind("M", "Int", &ints, &[json!(1e300)], &Map::new()).unwrap_err();
        assert!(matches!(err, BindingError::ArgumentMismatch(_)));

        let floats = vec![candidate("Float", vec![param("x", ParamType::Float)])];
        let (_, args) = bind("M", "Float", &floats, &[json!(7)], &Map::new()).unwrap();
        assert_eq!(args.get::<f64>(0).unwrap(), 7.0);
    }

    #[test]
    fn char_requires_exactly_one_character() {
        let chars = vec![candidate("Char", vec![param("c", ParamType::Char)])];
        assert!(bind("M", "Char", &chars, &[json!("x")], &Map::new()).is_ok());
        let err = bind("M", "Char", &chars, &[json!("xy")], &Map::new()).unwrap_err();
        assert!(matches!(err, BindingError::ArgumentMismatch(_)));
    }

    #[tokio::test]
    async fn void_methods_return_null_and_panics_become_faults() {
        let void = Candidate::new(
            "Touch".into(),
            Vec::new(),
            Returns::Void,
            Arc::new(|_: Args| -> Result<Outcome, GuestError> { Ok(Outcome::Ready(json!("ignored"))) }),
        );
        let (c, args) = bind("M", "Touch", std::slice::from_ref(&void), &[], &Map::new()).unwrap();
        assert_eq!(invoke(c, args).await.unwrap(), Value::Null);

        let boom = Candidate::new(
            "Boom".into(),
            Vec::new(),
            Returns::Value,
            Arc::new(|_: Args| -> Result<Outcome, GuestError> { panic!("kaboom") }),
        );
        let (c, args) = bind("M", "Boom", std::slice::from_ref(&boom), &[], &Map::new()).unwrap();
        let err = invoke(c, args).await.unwrap_err();
        assert!(
            matches!(err, Error::GuestFault { ref guest_type, ref message } if guest_type == "panic" && message == "kaboom")
        );
    }

    #[tokio::test]
    async fn deferred_results_are_awaited() {
        let later = Candidate::new(
            "Later".into(),
            Vec::new(),
            Returns::Value,
            Arc::new(|_: Args| -> Result<Outcome, GuestError> {
                Ok(Outcome::Deferred(Box::pin(async {
                    tokio::task::yield_now().await;
                    Err(GuestError::new("Overflow", "too big"))
                })))
            }),
        );
        let (c, args) = bind("M", "Later", std::slice::from_ref(&later), &[], &Map::new()).unwrap();
        let err = invoke(c, args).await.unwrap_err();
        assert!(matches!(err, Error::GuestFault { ref guest_type, .. } if guest_type == "Overflow"));
    }
}

//! Method bindings
//!
//! A [`MethodBinding`] is built once at registration from a host function
//! and never changes. It has two entry points: [`MethodBinding::call_variant`]
//! for type-erased arguments and [`MethodBinding::call_direct`] for
//! fixed-width slots in a [`CallFrame`]. Both decode into [`Value`]s,
//! convert each to the exact parameter type and run the same invoker.

use std::any::Any;
use std::sync::Arc;

use ext_variant::{
    read_direct, write_direct, ArgMetadata, ArgType, Marshal, Value, Variant, VariantRef,
    VariantType,
};

use crate::call::CallFrame;
use crate::engine::{MethodInfo, PropertyInfo};
use crate::error::CallError;
use crate::flags::MethodFlags;

/// Id of a registered method, never zero
pub type MethodId = u64;

/// How a bound function receives the instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receiver {
    /// `&mut T`
    Exclusive,
    /// `&T`
    Shared,
    /// No instance
    Static,
}

/// Host-side shape of a bound function, before validation
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub receiver: Receiver,
    /// `None` marks an argument type with no wire representation
    pub args: Vec<Option<ArgType>>,
    pub ret: Option<ArgType>,
    /// False for functions returning `()`
    pub returns: bool,
}

impl Signature {
    pub fn new(
        receiver: Receiver,
        args: Vec<Option<ArgType>>,
        ret: Option<ArgType>,
        returns: bool,
    ) -> Self {
        Self {
            receiver,
            args,
            ret,
            returns,
        }
    }

    pub fn is_representable(&self) -> bool {
        self.args.iter().all(Option::is_some) && (!self.returns || self.ret.is_some())
    }

    /// Rendering used in mismatch reports, e.g. `(float) -> bool`
    pub fn describe(&self) -> String {
        let args: Vec<&str> = self
            .args
            .iter()
            .map(|a| a.map_or("?", |t| t.variant_type.name()))
            .collect();
        let mut out = format!("({})", args.join(", "));
        if self.returns {
            out.push_str(" -> ");
            out.push_str(self.ret.map_or("?", |t| t.variant_type.name()));
        }
        out
    }
}

/// Type-erased host function
pub(crate) type Invoker =
    dyn Fn(Option<&mut dyn Any>, Vec<Value>) -> Result<Value, CallError> + Send + Sync;

/// One validated argument
#[derive(Debug, Clone, PartialEq)]
pub struct ArgInfo {
    pub name: String,
    pub ty: ArgType,
}

/// Registered method, immutable
pub struct MethodBinding {
    name: String,
    args: Vec<ArgInfo>,
    ret: Option<ArgType>,
    flags: MethodFlags,
    invoker: Arc<Invoker>,
}

impl MethodBinding {
    pub(crate) fn new(
        name: String,
        args: Vec<ArgInfo>,
        ret: Option<ArgType>,
        flags: MethodFlags,
        invoker: Arc<Invoker>,
    ) -> Self {
        Self {
            name,
            args,
            ret,
            flags,
            invoker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[ArgInfo] {
        &self.args
    }

    pub fn ret(&self) -> Option<ArgType> {
        self.ret
    }

    pub fn flags(&self) -> MethodFlags {
        self.flags
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    pub fn arity(&self) -> usize {
        self.args.len()
    }

    /// Direct-convention kinds of the arguments, in order
    pub fn arg_kinds(&self) -> Vec<VariantType> {
        self.args.iter().map(|a| a.ty.variant_type).collect()
    }

    /// Descriptor submitted to the engine
    pub fn info(&self, id: MethodId) -> MethodInfo {
        MethodInfo {
            name: self.name.clone(),
            userdata: id,
            flags: self.flags,
            arguments: self
                .args
                .iter()
                .map(|a| PropertyInfo::new(a.name.clone(), &a.ty))
                .collect(),
            argument_metadata: self.args.iter().map(|a| a.ty.metadata).collect(),
            return_value: self.ret.map(|r| PropertyInfo::new("", &r)),
            return_metadata: self.ret.map_or(ArgMetadata::None, |r| r.metadata),
        }
    }

    /// Run with already-decoded arguments
    pub fn invoke(&self, receiver: Option<&mut dyn Any>, args: Vec<Value>) -> Result<Value, CallError> {
        if args.len() > self.args.len() {
            return Err(CallError::TooManyArguments {
                expected: self.args.len(),
                got: args.len(),
            });
        }
        if args.len() < self.args.len() {
            return Err(CallError::TooFewArguments {
                expected: self.args.len(),
                got: args.len(),
            });
        }
        if receiver.is_none() && !self.is_static() {
            return Err(CallError::InstanceIsNull);
        }
        let value = (self.invoker)(receiver, args)?;
        match (self.ret, &value) {
            (Some(ret), Value::Int(i)) if ret.metadata.is_int() => {
                ret.metadata
                    .check_int(*i)
                    .map_err(|e| CallError::Failed(format!("{}: {e}", self.name)))?;
            }
            _ => {}
        }
        Ok(value)
    }

    /// Variant path: arguments may be anything, every failure is reported
    pub fn call_variant(
        &self,
        receiver: Option<&mut dyn Any>,
        args: &[VariantRef<'_>],
    ) -> Result<Variant, CallError> {
        let mut values = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            let expected = self
                .args
                .get(index)
                .map_or(VariantType::Nil, |a| a.ty.variant_type);
            let value = arg
                .to_value()
                .map_err(|e| CallError::argument_error(index, expected, e))?;
            values.push(value);
        }
        let result = self.invoke(receiver, values)?;
        Ok(match self.ret {
            Some(_) => Variant::new(result),
            None => Variant::nil(),
        })
    }

    /// Direct path: slots follow the declared layout. A slot that does not
    /// decode means the engine broke the layout contract.
    pub fn call_direct(
        &self,
        receiver: Option<&mut dyn Any>,
        frame: &mut CallFrame,
    ) -> Result<(), CallError> {
        let (expected, got) = (self.args.len(), frame.arg_count());
        if got > expected {
            return Err(CallError::TooManyArguments { expected, got });
        }
        if got < expected {
            return Err(CallError::TooFewArguments { expected, got });
        }
        let mut values = Vec::with_capacity(self.args.len());
        for (index, arg) in self.args.iter().enumerate() {
            // SAFETY: frames are built by `CallFrame::stage` or by the
            // unsafe loaders, whose callers vouch for the payload pointers
            let value = unsafe { read_direct(arg.ty.variant_type, frame.arg(index)) }
                .unwrap_or_else(|e| {
                    panic!("{}: direct argument {index} is malformed: {e}", self.name)
                });
            values.push(value);
        }
        let result = self.invoke(receiver, values)?;
        if let Some(ret) = self.ret {
            let slot = frame.ret_slot(ret.variant_type);
            write_direct(ret.variant_type, &result, slot)
                .map_err(|e| CallError::Failed(format!("{}: {e}", self.name)))?;
            frame.mark_returned();
        }
        Ok(())
    }
}

impl std::fmt::Debug for MethodBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodBinding")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("ret", &self.ret)
            .field("flags", &self.flags)
            .finish()
    }
}

fn take_arg<A: Marshal>(
    args: &mut std::vec::IntoIter<Value>,
    index: usize,
) -> Result<A, CallError> {
    let expected = A::variant_type().unwrap_or(VariantType::Nil);
    let value = args.next().ok_or(CallError::TooFewArguments {
        expected: index + 1,
        got: index,
    })?;
    A::from_value(value).map_err(|e| CallError::argument_error(index, expected, e))
}

#[doc(hidden)]
pub struct Exclusive;

#[doc(hidden)]
pub struct Shared;

/// Host functions that can be bound as instance methods
pub trait IntoMethod<T, Marker>: Send + Sync + 'static {
    fn signature() -> Signature;

    #[doc(hidden)]
    fn into_invoker(self) -> Arc<Invoker>;
}

/// Host functions that can be bound as static methods
pub trait IntoStaticMethod<Marker>: Send + Sync + 'static {
    fn signature() -> Signature;

    #[doc(hidden)]
    fn into_invoker(self) -> Arc<Invoker>;
}

macro_rules! impl_into_method {
    ($($ty:ident $var:ident $idx:tt),*) => {
        impl<T, F, R, $($ty,)*> IntoMethod<T, (Exclusive, R, $($ty,)*)> for F
        where
            T: 'static,
            F: Fn(&mut T, $($ty),*) -> R + Send + Sync + 'static,
            R: Marshal,
            $($ty: Marshal,)*
        {
            fn signature() -> Signature {
                Signature::new(
                    Receiver::Exclusive,
                    vec![$($ty::arg_type()),*],
                    R::arg_type(),
                    !R::IS_VOID,
                )
            }

            #[allow(unused_mut, unused_variables)]
            fn into_invoker(self) -> Arc<Invoker> {
                let func = self;
                Arc::new(move |receiver: Option<&mut dyn Any>, args: Vec<Value>| {
                    let this = receiver
                        .and_then(|r| r.downcast_mut::<T>())
                        .ok_or(CallError::InstanceIsNull)?;
                    let mut args = args.into_iter();
                    $(let $var = take_arg::<$ty>(&mut args, $idx)?;)*
                    Ok(func(this, $($var),*).to_value())
                })
            }
        }

        impl<T, F, R, $($ty,)*> IntoMethod<T, (Shared, R, $($ty,)*)> for F
        where
            T: 'static,
            F: Fn(&T, $($ty),*) -> R + Send + Sync + 'static,
            R: Marshal,
            $($ty: Marshal,)*
        {
            fn signature() -> Signature {
                Signature::new(
                    Receiver::Shared,
                    vec![$($ty::arg_type()),*],
                    R::arg_type(),
                    !R::IS_VOID,
                )
            }

            #[allow(unused_mut, unused_variables)]
            fn into_invoker(self) -> Arc<Invoker> {
                let func = self;
                Arc::new(move |receiver: Option<&mut dyn Any>, args: Vec<Value>| {
                    let this = receiver
                        .and_then(|r| r.downcast_ref::<T>())
                        .ok_or(CallError::InstanceIsNull)?;
                    let mut args = args.into_iter();
                    $(let $var = take_arg::<$ty>(&mut args, $idx)?;)*
                    Ok(func(this, $($var),*).to_value())
                })
            }
        }

        impl<F, R, $($ty,)*> IntoStaticMethod<(R, $($ty,)*)> for F
        where
            F: Fn($($ty),*) -> R + Send + Sync + 'static,
            R: Marshal,
            $($ty: Marshal,)*
        {
            fn signature() -> Signature {
                Signature::new(
                    Receiver::Static,
                    vec![$($ty::arg_type()),*],
                    R::arg_type(),
                    !R::IS_VOID,
                )
            }

            #[allow(unused_mut, unused_variables)]
            fn into_invoker(self) -> Arc<Invoker> {
                let func = self;
                Arc::new(move |_receiver: Option<&mut dyn Any>, args: Vec<Value>| {
                    let mut args = args.into_iter();
                    $(let $var = take_arg::<$ty>(&mut args, $idx)?;)*
                    Ok(func($($var),*).to_value())
                })
            }
        }
    };
}

impl_into_method!();
impl_into_method!(A0 a0 0);
impl_into_method!(A0 a0 0, A1 a1 1);
impl_into_method!(A0 a0 0, A1 a1 1, A2 a2 2);
impl_into_method!(A0 a0 0, A1 a1 1, A2 a2 2, A3 a3 3);
impl_into_method!(A0 a0 0, A1 a1 1, A2 a2 2, A3 a3 3, A4 a4 4);
impl_into_method!(A0 a0 0, A1 a1 1, A2 a2 2, A3 a3 3, A4 a4 4, A5 a5 5);

#[cfg(test)]
mod tests {
    use super::*;
    use ext_variant::HostOnly;

    #[derive(Default)]
    struct Gauge {
        level: i64,
    }

    impl Gauge {
        fn raise(&mut self, by: i64) -> i64 {
            self.level += by;
            self.level
        }

        fn level(&self) -> i64 {
            self.level
        }
    }

    fn bind<M, F: IntoMethod<Gauge, M>>(name: &str, f: F) -> MethodBinding {
        let sig = F::signature();
        let args = sig
            .args
            .iter()
            .enumerate()
            .map(|(i, t)| ArgInfo {
                name: format!("arg{i}"),
                ty: t.unwrap(),
            })
            .collect();
        MethodBinding::new(name.into(), args, sig.ret, MethodFlags::NORMAL, f.into_invoker())
    }

    #[test]
    fn test_signatures() {
        let sig = <fn(&mut Gauge, i64) -> i64 as IntoMethod<Gauge, _>>::signature();
        assert_eq!(sig.receiver, Receiver::Exclusive);
        assert_eq!(sig.describe(), "(int) -> int");

        let sig = <fn(&mut Gauge, HostOnly<u8>) as IntoMethod<Gauge, _>>::signature();
        assert!(!sig.is_representable());
        assert!(!sig.returns);
    }

    #[test]
    fn test_invoke_exclusive_and_shared() {
        let raise = bind("raise", Gauge::raise);
        let level = bind("level", Gauge::level);
        let mut gauge = Gauge::default();

        assert_eq!(
            raise.invoke(Some(&mut gauge), vec![Value::Int(5)]).unwrap(),
            Value::Int(5)
        );
        assert_eq!(level.invoke(Some(&mut gauge), vec![]).unwrap(), Value::Int(5));
    }

    #[test]
    fn test_arity_errors() {
        let raise = bind("raise", Gauge::raise);
        let mut gauge = Gauge::default();
        assert_eq!(
            raise.invoke(Some(&mut gauge), vec![]),
            Err(CallError::TooFewArguments {
                expected: 1,
                got: 0
            })
        );
        assert!(matches!(
            raise.invoke(Some(&mut gauge), vec![Value::Int(1), Value::Int(2)]),
            Err(CallError::TooManyArguments { .. })
        ));
        assert_eq!(
            raise.invoke(None, vec![Value::Int(1)]),
            Err(CallError::InstanceIsNull)
        );
    }

    #[test]
    fn test_conversion_error_names_argument() {
        let raise = bind("raise", Gauge::raise);
        let mut gauge = Gauge::default();
        let err = raise
            .invoke(Some(&mut gauge), vec![Value::from("ten")])
            .unwrap_err();
        assert!(matches!(
            err,
            CallError::InvalidArgument {
                index: 0,
                expected: VariantType::Int,
                ..
            }
        ));
        assert_eq!(err.kind(), crate::error::CallErrorKind::InvalidArgument);
    }

    #[test]
    fn test_variant_path() {
        let raise = bind("raise", Gauge::raise);
        let mut gauge = Gauge::default();
        let arg = Variant::new(Value::Int(3));
        let result = raise
            .call_variant(Some(&mut gauge), &[arg.borrow()])
            .unwrap();
        assert_eq!(result.to_value().unwrap(), Value::Int(3));
    }

    #[test]
    fn test_direct_path() {
        let raise = bind("raise", Gauge::raise);
        let mut gauge = Gauge { level: 1 };
        let mut frame =
            CallFrame::stage(&[VariantType::Int], &[Value::Int(2)], Some(VariantType::Int)).unwrap();
        raise.call_direct(Some(&mut gauge), &mut frame).unwrap();
        assert_eq!(frame.take_return().unwrap(), Some(Value::Int(3)));
    }

    #[test]
    fn test_static_binding() {
        fn double(x: i64) -> i64 {
            x * 2
        }
        let sig = <fn(i64) -> i64 as IntoStaticMethod<_>>::signature();
        assert_eq!(sig.receiver, Receiver::Static);
        let binding = MethodBinding::new(
            "double".into(),
            vec![ArgInfo {
                name: "x".into(),
                ty: ArgType::of(VariantType::Int),
            }],
            sig.ret,
            MethodFlags::STATIC,
            IntoStaticMethod::into_invoker(double as fn(i64) -> i64),
        );
        assert_eq!(binding.invoke(None, vec![Value::Int(21)]).unwrap(), Value::Int(42));
    }

    #[test]
    fn test_narrowed_return_is_range_checked() {
        let raise = bind("raise", Gauge::raise);
        let binding = MethodBinding::new(
            "raise".into(),
            raise.args().to_vec(),
            Some(ArgType::with_metadata(VariantType::Int, ArgMetadata::IntIsInt8)),
            MethodFlags::NORMAL,
            raise.invoker.clone(),
        );
        let mut gauge = Gauge::default();
        assert!(binding.invoke(Some(&mut gauge), vec![Value::Int(100)]).is_ok());
        assert!(matches!(
            binding.invoke(Some(&mut gauge), vec![Value::Int(100)]),
            Err(CallError::Failed(_))
        ));
    }
}

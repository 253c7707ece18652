use std::io::Write as _;

use crate::protocol::primitive::*;

/// A single prepared statement argument.
///
/// Arguments travel in their textual form; every parameter is declared as
/// `MYSQL_TYPE_VAR_STRING` and the server converts it to the column type.
///
/// # Examples
/// - (42i32, 100u64)
/// - (1i32, 3.14f64, "hello")
/// - ("test", None::<String>)  // NULL string
/// - [1, 2, 3]
pub trait Param {
    /// Returns true if this parameter is NULL
    fn is_null(&self) -> bool {
        false
    }

    /// Write the textual value as a length-encoded string
    ///
    /// Only called if is_null() returns false.
    fn encode_value(&self, out: &mut Vec<u8>);
}

/// Length-encode the `Display` form of a value
fn encode_display(out: &mut Vec<u8>, value: impl std::fmt::Display) {
    let mut text = Vec::with_capacity(24);
    // Writes into a Vec cannot fail
    let _ = write!(text, "{value}");
    write_bytes_lenenc(out, &text);
}

macro_rules! impl_param_display {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Param for $ty {
                fn encode_value(&self, out: &mut Vec<u8>) {
                    encode_display(out, self);
                }
            }
        )*
    };
}

impl_param_display!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64);

impl Param for bool {
    fn encode_value(&self, out: &mut Vec<u8>) {
        write_bytes_lenenc(out, if *self { b"1" } else { b"0" });
    }
}

impl Param for str {
    fn encode_value(&self, out: &mut Vec<u8>) {
        write_string_lenenc(out, self);
    }
}

impl Param for String {
    fn encode_value(&self, out: &mut Vec<u8>) {
        write_string_lenenc(out, self);
    }
}

impl Param for [u8] {
    fn encode_value(&self, out: &mut Vec<u8>) {
        write_bytes_lenenc(out, self);
    }
}

impl Param for Vec<u8> {
    fn encode_value(&self, out: &mut Vec<u8>) {
        write_bytes_lenenc(out, self);
    }
}

impl<T: Param + ?Sized> Param for &T {
    fn is_null(&self) -> bool {
        (*self).is_null()
    }

    fn encode_value(&self, out: &mut Vec<u8>) {
        (*self).encode_value(out);
    }
}

impl<T: Param> Param for Option<T> {
    fn is_null(&self) -> bool {
        match self {
            Some(value) => value.is_null(),
            None => true,
        }
    }

    fn encode_value(&self, out: &mut Vec<u8>) {
        if let Some(value) = self {
            value.encode_value(out);
        }
    }
}

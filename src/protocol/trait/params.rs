use crate::constant::ColumnType;
use crate::protocol::r#trait::param::Param;

/// Parameter list bound to a prepared statement execution
///
/// Implemented for `()`, tuples of up to 12 [`Param`]s, arrays, slices and vectors.
pub trait Params {
    /// Number of parameters
    fn len(&self) -> usize;

    /// Check if there are no parameters
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the parameter at `idx` is NULL
    fn is_null(&self, idx: usize) -> bool;

    /// Write the non-NULL values, in order
    fn write_values(&self, out: &mut Vec<u8>);

    /// Write NULL bitmap
    ///
    /// The NULL bitmap is (num_params + 7) / 8 bytes long.
    /// Bit is set to 1 if the parameter is NULL.
    fn write_null_bitmap(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + ((self.len() + 7) >> 3), 0);
        for idx in 0..self.len() {
            if self.is_null(idx) {
                out[start + (idx >> 3)] |= 1 << (idx & 7);
            }
        }
    }

    /// Write parameter types: every parameter is a VAR_STRING
    fn write_types(&self, out: &mut Vec<u8>) {
        for _ in 0..self.len() {
            out.push(ColumnType::MYSQL_TYPE_VAR_STRING as u8);
            out.push(0x00);
        }
    }
}

/// Empty parameters (no parameters)
impl Params for () {
    fn len(&self) -> usize {
        0
    }

    fn is_null(&self, _idx: usize) -> bool {
        false
    }

    fn write_values(&self, _out: &mut Vec<u8>) {}
}

impl<T: Param> Params for [T] {
    fn len(&self) -> usize {
        <[T]>::len(self)
    }

    fn is_null(&self, idx: usize) -> bool {
        self.get(idx).is_some_and(Param::is_null)
    }

    fn write_values(&self, out: &mut Vec<u8>) {
        for param in self.iter().filter(|param| !Param::is_null(*param)) {
            param.encode_value(out);
        }
    }
}

impl<T: Param, const N: usize> Params for [T; N] {
    fn len(&self) -> usize {
        N
    }

    fn is_null(&self, idx: usize) -> bool {
        self.as_slice().is_null(idx)
    }

    fn write_values(&self, out: &mut Vec<u8>) {
        self.as_slice().write_values(out);
    }
}

impl<T: Param> Params for Vec<T> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn is_null(&self, idx: usize) -> bool {
        self.as_slice().is_null(idx)
    }

    fn write_values(&self, out: &mut Vec<u8>) {
        self.as_slice().write_values(out);
    }
}

impl<P: Params + ?Sized> Params for &P {
    fn len(&self) -> usize {
        (*self).len()
    }

    fn is_null(&self, idx: usize) -> bool {
        (*self).is_null(idx)
    }

    fn write_values(&self, out: &mut Vec<u8>) {
        (*self).write_values(out);
    }
}

macro_rules! impl_params_for_tuple {
    ($len:expr; $($idx:tt $name:ident),+) => {
        impl<$($name: Param),+> Params for ($($name,)+) {
            fn len(&self) -> usize {
                $len
            }

            fn is_null(&self, idx: usize) -> bool {
                match idx {
                    $($idx => Param::is_null(&self.$idx),)+
                    _ => false,
                }
            }

            fn write_values(&self, out: &mut Vec<u8>) {
                $(
                    if !Param::is_null(&self.$idx) {
                        self.$idx.encode_value(out);
                    }
                )+
            }
        }
    };
}

impl_params_for_tuple!(1; 0 A);
impl_params_for_tuple!(2; 0 A, 1 B);
impl_params_for_tuple!(3; 0 A, 1 B, 2 C);
impl_params_for_tuple!(4; 0 A, 1 B, 2 C, 3 D);
impl_params_for_tuple!(5; 0 A, 1 B, 2 C, 3 D, 4 E);
impl_params_for_tuple!(6; 0 A, 1 B, 2 C, 3 D, 4 E, 5 F);
impl_params_for_tuple!(7; 0 A, 1 B, 2 C, 3 D, 4 E, 5 F, 6 G);
impl_params_for_tuple!(8; 0 A, 1 B, 2 C, 3 D, 4 E, 5 F, 6 G, 7 H);
impl_params_for_tuple!(9; 0 A, 1 B, 2 C, 3 D, 4 E, 5 F, 6 G, 7 H, 8 I);
impl_params_for_tuple!(10; 0 A, 1 B, 2 C, 3 D, 4 E, 5 F, 6 G, 7 H, 8 I, 9 J);
impl_params_for_tuple!(11; 0 A, 1 B, 2 C, 3 D, 4 E, 5 F, 6 G, 7 H, 8 I, 9 J, 10 K);
impl_params_for_tuple!(12; 0 A, 1 B, 2 C, 3 D, 4 E, 5 F, 6 G, 7 H, 8 I, 9 J, 10 K, 11 L);

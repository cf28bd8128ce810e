#[doc(hidden)]
#[macro_export]
macro_rules! raw_enum {
    (
        $(#[doc = $doc:literal])*
        #[repr($repr:ty)]
        $vis:vis enum $name:ident {
            $(
                $(#[$($variant_meta:meta)*])*
                $variant:ident = $value:expr
            ),* $(,)?
        }
    ) => {
        $(#[doc = $doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(transparent)]
        $vis struct $name($repr);

        impl $name {
            $(
                $(#[$($variant_meta)*])*
                $vis const $variant: Self = Self($value);
            )*

            /// Construct an instance from the underlying repr without
            /// validating that it names a known constant.
            #[doc(hidden)]
            pub const fn new(value: $repr) -> Self {
                Self(value)
            }

            /// Get the underlying representation.
            #[doc(hidden)]
            pub const fn get(self) -> $repr {
                self.0
            }

            /// Access the underlying representation mutably.
            #[doc(hidden)]
            pub const fn as_mut(&mut self) -> &mut $repr {
                &mut self.0
            }
        }

        impl ::core::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                match *self {
                    $(Self::$variant => f.write_str(stringify!($variant)),)*
                    b => write!(f, "INVALID({:02x})", b.0),
                }
            }
        }
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! raw_set {
    (
        $(#[doc = $doc:literal])*
        #[repr($repr:ty)]
        $vis:vis enum $name:ident {
            $(
                $(#[$($variant_meta:meta)*])*
                $variant:ident = $value:expr
            ),* $(,)?
        }
    ) => {
        $(#[doc = $doc])*
        #[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(transparent)]
        $vis struct $name($repr);

        impl $name {
            $(
                $(#[$($variant_meta)*])*
                $vis const $variant: Self = Self($value);
            )*

            /// Construct an instance from the underlying repr. Unknown bits
            /// are preserved.
            #[doc(hidden)]
            pub const fn new(value: $repr) -> Self {
                Self(value)
            }

            /// Get the underlying representation.
            #[doc(hidden)]
            pub const fn get(self) -> $repr {
                self.0
            }

            /// Access the underlying representation mutably.
            #[doc(hidden)]
            pub const fn as_mut(&mut self) -> &mut $repr {
                &mut self.0
            }

            /// Test if all bits of `other` are set in `self`.
            $vis const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl ::core::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                struct Raw(&'static str);

                impl ::core::fmt::Debug for Raw {
                    #[inline]
                    fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                        write!(f, "{}", self.0)
                    }
                }

                struct Bits($repr);

                impl ::core::fmt::Debug for Bits {
                    #[inline]
                    fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                        write!(f, "{:b}", self.0)
                    }
                }

                let mut f = f.debug_set();
                let mut rest = self.0;

                $(
                    if $value != 0 && self.contains(Self::$variant) {
                        f.entry(&Raw(stringify!($variant)));
                        rest &= !$value;
                    }
                )*

                if rest != 0 {
                    f.entry(&Bits(rest));
                }

                f.finish()
            }
        }

        impl ::core::ops::BitOr<$name> for $name {
            type Output = Self;

            #[inline]
            fn bitor(self, rhs: $name) -> Self::Output {
                Self(self.0 | rhs.0)
            }
        }

        impl ::core::ops::BitOrAssign<$name> for $name {
            #[inline]
            fn bitor_assign(&mut self, rhs: $name) {
                self.0 |= rhs.0;
            }
        }

        impl ::core::ops::BitXor<$name> for $name {
            type Output = Self;

            #[inline]
            fn bitxor(self, rhs: $name) -> Self::Output {
                Self(self.0 ^ rhs.0)
            }
        }
    }
}

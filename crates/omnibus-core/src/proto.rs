//! Raw constants of the omnibus wire protocol.
//!
//! These are open enums: unknown values can arrive off the wire and must be
//! representable so that validation can reject them with a useful error.

raw_enum! {
    /// A type code as it appears in a signature.
    #[repr(u8)]
    pub enum Type {
        /// Not a valid type code, used to terminate traversal.
        INVALID = 0,
        /// 8-bit unsigned integer.
        BYTE = b'y',
        /// Boolean value stored as a 32-bit integer, 0 or 1.
        BOOLEAN = b'b',
        /// 16-bit signed integer.
        INT16 = b'n',
        /// 16-bit unsigned integer.
        UINT16 = b'q',
        /// 32-bit signed integer.
        INT32 = b'i',
        /// 32-bit unsigned integer.
        UINT32 = b'u',
        /// 64-bit signed integer.
        INT64 = b'x',
        /// 64-bit unsigned integer.
        UINT64 = b't',
        /// IEEE 754 double precision floating point.
        DOUBLE = b'd',
        /// Length-prefixed UTF-8 string with a trailing NUL.
        STRING = b's',
        /// A string constrained to the object path grammar.
        OBJECT_PATH = b'o',
        /// A length-prefixed signature with a trailing NUL.
        SIGNATURE = b'g',
        /// A value carrying its own single-type signature inline.
        VARIANT = b'v',
        /// An index into an out-of-band file descriptor array.
        UNIX_FD = b'h',
        /// Array marker, followed by the element type.
        ARRAY = b'a',
        /// Start of a struct.
        OPEN_PAREN = b'(',
        /// End of a struct.
        CLOSE_PAREN = b')',
        /// Start of a dict entry.
        OPEN_BRACE = b'{',
        /// End of a dict entry.
        CLOSE_BRACE = b'}',
    }
}

impl Type {
    /// The alignment in bytes of a value of this type.
    ///
    /// Container openers report the alignment of the container itself: arrays
    /// align their length field to 4, structs and dict entries align to 8.
    pub fn alignment(self) -> usize {
        match self {
            Type::BYTE | Type::BOOLEAN | Type::SIGNATURE | Type::VARIANT => 1,
            Type::INT16 | Type::UINT16 => 2,
            Type::INT32 | Type::UINT32 | Type::UNIX_FD => 4,
            Type::STRING | Type::OBJECT_PATH | Type::ARRAY => 4,
            Type::INT64 | Type::UINT64 | Type::DOUBLE => 8,
            Type::OPEN_PAREN | Type::OPEN_BRACE => 8,
            _ => 1,
        }
    }

    /// The marshalled size of this type if it is fixed, `None` for
    /// variable-width and container types.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            Type::BYTE | Type::BOOLEAN => Some(1),
            Type::INT16 | Type::UINT16 => Some(2),
            Type::INT32 | Type::UINT32 | Type::UNIX_FD => Some(4),
            Type::INT64 | Type::UINT64 | Type::DOUBLE => Some(8),
            _ => None,
        }
    }

    /// Test if this is a basic (non-container) type code.
    pub fn is_basic(self) -> bool {
        matches!(
            self,
            Type::BYTE
                | Type::BOOLEAN
                | Type::INT16
                | Type::UINT16
                | Type::INT32
                | Type::UINT32
                | Type::INT64
                | Type::UINT64
                | Type::DOUBLE
                | Type::STRING
                | Type::OBJECT_PATH
                | Type::SIGNATURE
                | Type::UNIX_FD
        )
    }

    /// Test if this type code opens a container.
    pub fn is_container(self) -> bool {
        matches!(
            self,
            Type::ARRAY | Type::VARIANT | Type::OPEN_PAREN | Type::OPEN_BRACE
        )
    }
}

raw_enum! {
    /// The byte order of a message.
    #[repr(u8)]
    pub enum Endianness {
        /// Little endian.
        LITTLE = b'l',
        /// Big endian.
        BIG = b'B',
    }
}

impl Endianness {
    /// The byte order of the host.
    #[cfg(target_endian = "little")]
    pub const NATIVE: Self = Self::LITTLE;
    /// The byte order of the host.
    #[cfg(target_endian = "big")]
    pub const NATIVE: Self = Self::BIG;
}

raw_enum! {
    /// The type of a message.
    #[repr(u8)]
    pub enum MessageType {
        /// Not a valid message type.
        INVALID = 0,
        /// Method call, may prompt a reply.
        METHOD_CALL = 1,
        /// Method reply with returned data.
        METHOD_RETURN = 2,
        /// Error reply.
        ERROR = 3,
        /// Signal emission.
        SIGNAL = 4,
    }
}

raw_set! {
    /// Flags carried in the fixed message header.
    #[repr(u8)]
    pub enum Flags {
        /// An empty set of flags.
        EMPTY = 0,
        /// The sender does not want a method return or error reply.
        NO_REPLY_EXPECTED = 1,
        /// The bus must not activate an owner for the destination name.
        NO_AUTO_START = 2,
    }
}

raw_enum! {
    /// Field codes of the header-fields array.
    #[repr(u8)]
    pub enum FieldCode {
        /// Not a valid field code.
        INVALID = 0,
        /// The object path of a method call or signal.
        PATH = 1,
        /// The interface of a method call or signal.
        INTERFACE = 2,
        /// The member of a method call or signal.
        MEMBER = 3,
        /// The error name of an error reply.
        ERROR_NAME = 4,
        /// The serial this message replies to.
        REPLY_SERIAL = 5,
        /// The name of the connection the message is addressed to.
        DESTINATION = 6,
        /// The unique name of the sending connection.
        SENDER = 7,
        /// The signature of the message body.
        SIGNATURE = 8,
    }
}

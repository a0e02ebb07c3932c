use std::fmt;

use crate::message::MessageError;

/// CoAP message code: an 8-bit unsigned integer split into a 3-bit class
/// (most significant bits) and a 5-bit detail (least significant bits),
/// documented as `c.dd`.
///
/// Unknown detail values within a known response class are preserved as
/// `Unknown` so that every decodable raw value survives a decode/encode
/// round-trip unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoapCode {
    /// A request method (class 0)
    Request(Method),
    /// A response (classes 2, 4 and 5)
    Response(ResponseCode),
}

const CLASS_MASK: u8 = 0b111_00000;
const CLASS_REQUEST: u8 = 0 << 5;
const CLASS_SUCCESS: u8 = 2 << 5;
const CLASS_CLIENT_ERROR: u8 = 4 << 5;
const CLASS_SERVER_ERROR: u8 = 5 << 5;

impl CoapCode {
    /// Decodes a raw 8-bit code.
    ///
    /// Codes in an unassigned class, and request codes with an unassigned
    /// method detail, are rejected with [`MessageError::UnexpectedCode`].
    pub fn from_raw(raw: u8) -> Result<Self, MessageError> {
        let detail = raw & !CLASS_MASK;
        match raw & CLASS_MASK {
            CLASS_REQUEST => match Method::from_detail(detail) {
                Some(method) => Ok(Self::Request(method)),
                None => Err(MessageError::UnexpectedCode { code: raw }),
            },
            CLASS_SUCCESS => Ok(Self::Response(ResponseCode::Success(detail.into()))),
            CLASS_CLIENT_ERROR => Ok(Self::Response(ResponseCode::ClientError(detail.into()))),
            CLASS_SERVER_ERROR => Ok(Self::Response(ResponseCode::ServerError(detail.into()))),
            _ => Err(MessageError::UnexpectedCode { code: raw }),
        }
    }

    /// Encodes back into the raw 8-bit wire value
    pub fn to_raw(self) -> u8 {
        (self.class() << 5) | self.detail()
    }

    /// Whether this is a response in the success class (2.xx)
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Response(ResponseCode::Success(_)))
    }

    /// The HTTP-style numeric rendering, e.g. 205 for 2.05
    pub fn http_equivalent(&self) -> u16 {
        u16::from(self.class()) * 100 + u16::from(self.detail())
    }

    fn class(&self) -> u8 {
        match self {
            Self::Request(_) => 0,
            Self::Response(ResponseCode::Success(_)) => 2,
            Self::Response(ResponseCode::ClientError(_)) => 4,
            Self::Response(ResponseCode::ServerError(_)) => 5,
        }
    }

    fn detail(&self) -> u8 {
        match self {
            Self::Request(method) => *method as u8,
            Self::Response(ResponseCode::Success(code)) => code.detail(),
            Self::Response(ResponseCode::ClientError(code)) => code.detail(),
            Self::Response(ResponseCode::ServerError(code)) => code.detail(),
        }
    }
}

impl From<Method> for CoapCode {
    fn from(method: Method) -> Self {
        Self::Request(method)
    }
}

impl From<ResponseCode> for CoapCode {
    fn from(code: ResponseCode) -> Self {
        Self::Response(code)
    }
}

impl fmt::Display for CoapCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// A request method (detail of a class-0 code)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET (0.01)
    Get = 1,
    /// POST (0.02)
    Post = 2,
    /// PUT (0.03)
    Put = 3,
    /// DELETE (0.04)
    Delete = 4,
}

impl Method {
    fn from_detail(detail: u8) -> Option<Self> {
        match detail {
            1 => Some(Self::Get),
            2 => Some(Self::Post),
            3 => Some(Self::Put),
            4 => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        })
    }
}

/// A response code, grouped by class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    /// 2.xx
    Success(SuccessCode),
    /// 4.xx
    ClientError(ClientErrorCode),
    /// 5.xx
    ServerError(ServerErrorCode),
}

macro_rules! detail_codes {
    {
        $(#[$meta:meta])*
        $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:literal,)* }
    } => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant,)*
            /// A detail value with no assigned name, preserved verbatim
            Unknown(u8),
        }

        impl $name {
            fn detail(self) -> u8 {
                match self {
                    $(Self::$variant => $value,)*
                    Self::Unknown(value) => value,
                }
            }
        }

        impl From<u8> for $name {
            fn from(detail: u8) -> Self {
                match detail {
                    $($value => Self::$variant,)*
                    other => Self::Unknown(other),
                }
            }
        }
    };
}

detail_codes! {
    /// Detail of a 2.xx response code
    SuccessCode {
        /// 2.00
        Success = 0,
        /// 2.01
        Created = 1,
        /// 2.02
        Deleted = 2,
        /// 2.03
        Valid = 3,
        /// 2.04
        Changed = 4,
        /// 2.05
        Content = 5,
    }
}

detail_codes! {
    /// Detail of a 4.xx response code
    ClientErrorCode {
        /// 4.00
        BadRequest = 0,
        /// 4.01
        Unauthorized = 1,
        /// 4.02
        BadOption = 2,
        /// 4.03
        Forbidden = 3,
        /// 4.04
        NotFound = 4,
        /// 4.05
        MethodNotAllowed = 5,
        /// 4.06
        NotAcceptable = 6,
        /// 4.08
        RequestEntityIncomplete = 8,
        /// 4.12
        PreconditionFailed = 12,
        /// 4.13
        RequestEntityTooLarge = 13,
        /// 4.15
        UnsupportedContentFormat = 15,
    }
}

detail_codes! {
    /// Detail of a 5.xx response code
    ServerErrorCode {
        /// 5.00
        InternalServerError = 0,
        /// 5.01
        NotImplemented = 1,
        /// 5.02
        BadGateway = 2,
        /// 5.03
        ServiceUnavailable = 3,
        /// 5.04
        GatewayTimeout = 4,
        /// 5.05
        ProxyingNotSupported = 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_decodable_value() {
        for raw in 0..=u8::MAX {
            if let Ok(code) = CoapCode::from_raw(raw) {
                assert_eq!(code.to_raw(), raw, "{code:?} did not round-trip");
            }
        }
    }

    #[test]
    fn decodes_known_codes() {
        assert_eq!(CoapCode::from_raw(0x01).unwrap(), CoapCode::Request(Method::Get));
        assert_eq!(CoapCode::from_raw(0x04).unwrap(), CoapCode::Request(Method::Delete));
        assert_eq!(
            CoapCode::from_raw(0x45).unwrap(),
            CoapCode::Response(ResponseCode::Success(SuccessCode::Content))
        );
        assert_eq!(
            CoapCode::from_raw(0x84).unwrap(),
            CoapCode::Response(ResponseCode::ClientError(ClientErrorCode::NotFound))
        );
        assert_eq!(
            CoapCode::from_raw(0xa0).unwrap(),
            CoapCode::Response(ResponseCode::ServerError(ServerErrorCode::InternalServerError))
        );
    }

    #[test]
    fn preserves_unknown_details() {
        let code = CoapCode::from_raw(0x5f).unwrap();
        assert_eq!(
            code,
            CoapCode::Response(ResponseCode::Success(SuccessCode::Unknown(31)))
        );
        assert_eq!(code.to_raw(), 0x5f);

        // 4.07 is unassigned but must survive untouched
        let code = CoapCode::from_raw(0x87).unwrap();
        assert_eq!(
            code,
            CoapCode::Response(ResponseCode::ClientError(ClientErrorCode::Unknown(7)))
        );
        assert_eq!(code.to_raw(), 0x87);
    }

    #[test]
    fn rejects_unassigned_classes_and_methods() {
        // empty code and unassigned request details
        assert!(CoapCode::from_raw(0x00).is_err());
        assert!(CoapCode::from_raw(0x05).is_err());
        assert!(CoapCode::from_raw(0x1f).is_err());
        // classes 1, 3, 6 and 7 are not assigned
        for class in [1u8, 3, 6, 7] {
            assert!(CoapCode::from_raw(class << 5).is_err());
        }
    }

    #[test]
    fn http_equivalents() {
        assert_eq!(
            CoapCode::Response(ResponseCode::Success(SuccessCode::Content)).http_equivalent(),
            205
        );
        assert_eq!(
            CoapCode::Response(ResponseCode::ClientError(ClientErrorCode::NotFound))
                .http_equivalent(),
            404
        );
        assert_eq!(CoapCode::Request(Method::Post).http_equivalent(), 2);
    }

    #[test]
    fn displays_class_dot_detail() {
        let code = CoapCode::Response(ResponseCode::Success(SuccessCode::Content));
        assert_eq!(code.to_string(), "2.05");
        assert_eq!(CoapCode::Request(Method::Get).to_string(), "0.01");
    }
}

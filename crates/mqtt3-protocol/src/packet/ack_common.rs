//! PUBACK, PUBREC, PUBREL, PUBCOMP and UNSUBACK share one body: a packet identifier.

macro_rules! define_ack_packet {
    (
        $(#[$meta:meta])*
        pub struct $name:ident;
        packet_type = $packet_type:expr;
        flags = $flags:expr;
        error_prefix = $prefix:literal;
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            pub packet_id: u16,
            pub dup: bool,
        }

        impl $name {
            #[must_use]
            pub fn new(packet_id: u16) -> Self {
                Self {
                    packet_id,
                    dup: false,
                }
            }

            #[must_use]
            pub fn with_dup(mut self, dup: bool) -> Self {
                self.dup = dup;
                self
            }
        }

        impl $crate::packet::MqttPacket for $name {
            fn packet_type(&self) -> $crate::packet::PacketType {
                $packet_type
            }

            fn flags(&self) -> u8 {
                if self.dup {
                    $flags | $crate::packet::FLAG_DUP
                } else {
                    $flags
                }
            }

            fn encode_body<B: bytes::BufMut>(&self, buf: &mut B) -> $crate::error::Result<()> {
                buf.put_u16(self.packet_id);
                Ok(())
            }

            fn decode_body<B: bytes::Buf>(
                buf: &mut B,
                fixed_header: &$crate::packet::FixedHeader,
            ) -> $crate::error::Result<Self> {
                if buf.remaining() < 2 {
                    return Err($crate::error::MqttError::MalformedPacket(format!(
                        "{} missing packet identifier",
                        $prefix
                    )));
                }
                let packet_id = buf.get_u16();
                Ok(Self {
                    packet_id,
                    dup: fixed_header.dup(),
                })
            }
        }
    };
}

pub(crate) use define_ack_packet;

mod socket;
mod sockopt;

pub use self::socket::{apply_options, ConnectionSocket, Phase, SocketOption, TcpSocket,
                       Transparent};

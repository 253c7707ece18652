mod conn;
mod driver;
mod statement;
mod stream;

pub use conn::Conn;
pub use statement::PreparedStatement;
pub use stream::Stream;

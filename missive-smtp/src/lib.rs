//! An SMTP submission client built directly on TCP and rustls.
//!
//! One call to [`deliver`] opens one connection, walks the SMTP conversation
//! (with STARTTLS and AUTH LOGIN when applicable), hands over a rendered
//! message and closes the connection again, whatever the outcome.
//!
//! ```no_run
//! use missive_smtp::{Attachment, DeliveryRequest, deliver};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let request = DeliveryRequest::builder("mail.example.com", 587)
//!     .credentials("enquiries", "hunter2")
//!     .from("noreply@example.com")
//!     .to("sales@example.com")
//!     .subject("New enquiry")
//!     .body("Please call me back.")
//!     .attachment(Attachment::new("brief.txt", b"...".to_vec()))
//!     .build()?;
//!
//! let receipt = deliver(&request).await?;
//! println!("{}", receipt.reply);
//! # Ok(())
//! # }
//! ```

pub mod delivery;
pub mod error;
pub mod extensions;
pub mod message;
pub mod reply;
pub mod request;
pub mod session;
mod tls;

pub use delivery::{Receipt, Stage, deliver};
pub use error::{Result, SmtpError};
pub use extensions::Extensions;
pub use message::{Attachment, Payload, build};
pub use reply::Reply;
pub use request::{Credentials, DeliveryRequest, DeliveryRequestBuilder};
pub use session::{Session, SessionOptions};

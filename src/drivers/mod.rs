pub mod chromedriver;
pub mod edgedriver;

pub use chromedriver::ChromeDriver;
pub use edgedriver::EdgeDriver;

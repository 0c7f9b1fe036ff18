use crate::wire::transaction_header::InfoCode;
use anyhow::bail;
use std::fmt::Debug;

/// What a single transaction came back with. Exactly one of three shapes: word
///  data (reads and the pre-modify value of RMW operations), byte data (byte-sliced
///  reads), or an error. Write acknowledgements are word data of length zero.
///
/// A non-success info code from the device is folded into [Response::error] at
///  construction so that callers have a single place to look.
pub struct Response {
    /// the info code the device reported, if a reply header was decoded at all
    pub info_code: Option<InfoCode>,
    pub words: Vec<u32>,
    pub bytes: Vec<u8>,
    pub error: Option<anyhow::Error>,
}

impl Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error {
            Some(e) => write!(f, "RESP{{ERR {}}}", e),
            None if self.bytes.is_empty() => write!(f, "RESP{{OK {} words}}", self.words.len()),
            None => write!(f, "RESP{{OK {} bytes}}", self.bytes.len()),
        }
    }
}

impl Response {
    pub fn of_words(info_code: InfoCode, words: Vec<u32>) -> Response {
        Response {
            info_code: Some(info_code),
            words,
            bytes: Vec::new(),
            error: Self::error_for(info_code),
        }
    }

    pub fn of_bytes(info_code: InfoCode, bytes: Vec<u8>) -> Response {
        Response {
            info_code: Some(info_code),
            words: Vec::new(),
            bytes,
            error: Self::error_for(info_code),
        }
    }

    /// a transaction that never got a usable reply, e.g. because the enclosing
    ///  packet's reply could not be parsed
    pub fn missing(error: anyhow::Error) -> Response {
        Response {
            info_code: None,
            words: Vec::new(),
            bytes: Vec::new(),
            error: Some(error),
        }
    }

    fn error_for(info_code: InfoCode) -> Option<anyhow::Error> {
        if info_code.is_success() {
            None
        }
        else {
            Some(anyhow::anyhow!("device reported: {}", info_code))
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_words(self) -> anyhow::Result<Vec<u32>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.words),
        }
    }

    /// accessor for responses that carry exactly one data word, i.e. RMW results
    pub fn into_word(self) -> anyhow::Result<u32> {
        let words = self.into_words()?;
        match words.as_slice() {
            [word] => Ok(*word),
            _ => bail!("expected exactly one data word, got {}", words.len()),
        }
    }

    pub fn into_bytes(self) -> anyhow::Result<Vec<u8>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.bytes),
        }
    }

    /// for write acknowledgements, where only success matters
    pub fn ack(self) -> anyhow::Result<()> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_of_words_success() {
        let response = Response::of_words(InfoCode::Success, vec![1, 2, 3]);
        assert!(response.is_ok());
        assert_eq!(response.info_code, Some(InfoCode::Success));
        assert_eq!(response.into_words().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_response_of_words_device_error() {
        let response = Response::of_words(InfoCode::BusReadError, vec![]);
        assert!(!response.is_ok());
        assert_eq!(response.info_code, Some(InfoCode::BusReadError));

        let err = response.into_words().unwrap_err();
        assert!(err.to_string().contains("bus error on read"));
    }

    #[test]
    fn test_response_of_bytes() {
        let response = Response::of_bytes(InfoCode::Success, vec![0xde, 0xad]);
        assert_eq!(response.into_bytes().unwrap(), vec![0xde, 0xad]);

        let response = Response::of_bytes(InfoCode::BusReadTimeout, vec![]);
        assert!(response.into_bytes().is_err());
    }

    #[test]
    fn test_response_missing() {
        let response = Response::missing(anyhow::anyhow!("insufficient bytes"));
        assert!(!response.is_ok());
        assert_eq!(response.info_code, None);
        assert!(response.ack().unwrap_err().to_string().contains("insufficient bytes"));
    }

    #[test]
    fn test_response_into_word() {
        assert_eq!(Response::of_words(InfoCode::Success, vec![42]).into_word().unwrap(), 42);
        assert!(Response::of_words(InfoCode::Success, vec![]).into_word().is_err());
        assert!(Response::of_words(InfoCode::Success, vec![1, 2]).into_word().is_err());
    }

    #[test]
    fn test_response_ack() {
        assert!(Response::of_words(InfoCode::Success, vec![]).ack().is_ok());
        assert!(Response::of_words(InfoCode::BusWriteError, vec![]).ack().is_err());
    }

    #[test]
    fn test_response_debug() {
        assert_eq!(format!("{:?}", Response::of_words(InfoCode::Success, vec![1, 2])), "RESP{OK 2 words}");
        assert_eq!(format!("{:?}", Response::of_bytes(InfoCode::Success, vec![7; 5])), "RESP{OK 5 bytes}");
        assert_eq!(format!("{:?}", Response::missing(anyhow::anyhow!("boom"))), "RESP{ERR boom}");
    }
}

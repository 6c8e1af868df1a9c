//! gpsd client: JSON reports over TCP.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::{Fix, FixSource};
use crate::error::{CollectorError, Result};

const WATCH_ENABLE: &str = "?WATCH={\"enable\":true,\"json\":true};\n";
const WATCH_DISABLE: &str = "?WATCH={\"enable\":false};\n";

/// Subset of a gpsd report we care about
#[derive(Debug, Deserialize)]
struct Report {
    class: String,
    #[serde(default)]
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
    alt: Option<f64>,
    #[serde(rename = "altMSL")]
    alt_msl: Option<f64>,
    track: Option<f64>,
    speed: Option<f64>,
}

/// Parse one gpsd JSON line; only TPV reports with a 2D/3D fix yield a `Fix`
pub fn parse_report(line: &str) -> Result<Option<Fix>> {
    let report: Report = serde_json::from_str(line)?;
    if report.class != "TPV" || report.mode < 2 {
        return Ok(None);
    }
    Ok(Some(Fix {
        latitude: report.lat,
        longitude: report.lon,
        altitude: report.alt_msl.or(report.alt),
        track: report.track,
        speed: report.speed,
    }))
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

/// gpsd fix source; connects lazily and reconnects after stream errors
pub struct GpsdSource {
    address: String,
    connection: Option<Connection>,
}

impl GpsdSource {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            address: format!("{}:{}", host, port),
            connection: None,
        }
    }

    async fn connect(&self) -> Result<Connection> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| CollectorError::Positioning(format!("gpsd at {}: {}", self.address, e)))?;
        let (read, mut writer) = stream.into_split();
        writer.write_all(WATCH_ENABLE.as_bytes()).await?;
        info!("Watching gpsd at {}", self.address);
        Ok(Connection {
            lines: BufReader::new(read).lines(),
            writer,
        })
    }
}

#[async_trait]
impl FixSource for GpsdSource {
    async fn next_fix(&mut self) -> Result<Option<Fix>> {
        if self.connection.is_none() {
            self.connection = Some(self.connect().await?);
        }
        let Some(connection) = self.connection.as_mut() else {
            return Ok(None);
        };

        // next_line is cancel safe, the reader wraps this call in a timeout
        match connection.lines.next_line().await {
            Ok(Some(line)) => match parse_report(&line) {
                Ok(fix) => Ok(fix),
                Err(e) => {
                    debug!("Skipping gpsd line: {}", e);
                    Ok(None)
                }
            },
            Ok(None) => {
                self.connection = None;
                Err(CollectorError::Positioning("gpsd closed the stream".to_string()))
            }
            Err(e) => {
                self.connection = None;
                Err(e.into())
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            let _ = connection.writer.write_all(WATCH_DISABLE.as_bytes()).await;
            let _ = connection.writer.shutdown().await;
            info!("gpsd stream released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::positioning::{PositionLabel, PositioningReader};
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_tpv_with_fix() {
        let line = r#"{"class":"TPV","mode":3,"lat":48.85,"lon":2.35,"altMSL":35.2,"track":181.0,"speed":13.4}"#;
        let fix = parse_report(line).unwrap().unwrap();
        assert_eq!(fix.latitude, Some(48.85));
        assert_eq!(fix.longitude, Some(2.35));
        assert_eq!(fix.altitude, Some(35.2));
        assert_eq!(fix.track, Some(181.0));
        assert_eq!(fix.speed, Some(13.4));
    }

    #[test]
    fn test_parse_legacy_alt_field() {
        let line = r#"{"class":"TPV","mode":3,"lat":1.0,"lon":2.0,"alt":100.0}"#;
        let fix = parse_report(line).unwrap().unwrap();
        assert_eq!(fix.altitude, Some(100.0));
        assert_eq!(fix.speed, None);
    }

    #[test]
    fn test_parse_ignores_no_fix_and_other_classes() {
        assert!(parse_report(r#"{"class":"TPV","mode":1}"#).unwrap().is_none());
        assert!(parse_report(r#"{"class":"SKY","satellites":[]}"#).unwrap().is_none());
        assert!(parse_report(r#"{"class":"VERSION","release":"3.25"}"#).unwrap().is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_report("not json").is_err());
    }

    #[tokio::test]
    async fn test_reader_over_fake_gpsd() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut watch = [0u8; 64];
            let n = tokio::io::AsyncReadExt::read(&mut socket, &mut watch).await.unwrap();
            assert!(String::from_utf8_lossy(&watch[..n]).starts_with("?WATCH"));
            socket
                .write_all(b"{\"class\":\"VERSION\",\"release\":\"3.25\"}\n{\"class\":\"TPV\",\"mode\":2,\"lat\":10.5,\"lon\":20.5}\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
        });

        let reader = PositioningReader::start(
            Box::new(GpsdSource::new("127.0.0.1", port)),
            Duration::from_millis(50),
        );
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(reader.label(PositionLabel::Latitude), Some(10.5));
        assert_eq!(reader.label(PositionLabel::Longitude), Some(20.5));
        assert_eq!(reader.label(PositionLabel::Altitude), None);

        reader.stop().await;
        server.await.unwrap();
    }
}

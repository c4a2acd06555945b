use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, ValueEnum};
use image::GrayImage;
use image::imageops::FilterType;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

include!("types.rs");
include!("session.rs");
include!("captcha.rs");
include!("extract.rs");
include!("navigator.rs");
include!("driver.rs");
include!("data_io.rs");
include!("runtime.rs");

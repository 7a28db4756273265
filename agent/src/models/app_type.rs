//! Application types

use serde::{Deserialize, Serialize};

/// Port the application listens on inside its container for static and
/// single-page builds served by the static file server
pub const STATIC_INTERNAL_PORT: u16 = 80;

/// Port every other application type listens on inside its container
pub const APP_INTERNAL_PORT: u16 = 3000;

/// Application type hint supplied with each deploy request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    /// Plain static files served as-is
    Static,

    /// Vite single-page app, built to `dist/`
    Vite,

    /// Create React App single-page app, built to `build/`
    React,

    /// Express server
    Express,

    /// Generic Node.js server
    Node,

    /// Next.js server
    Nextjs,

    /// NestJS server
    Nestjs,
}

impl AppType {
    /// Whether the app is served by the static file server
    pub fn is_static(&self) -> bool {
        matches!(self, AppType::Static | AppType::Vite | AppType::React)
    }

    /// Container-internal port, fixed per application type
    pub fn internal_port(&self) -> u16 {
        if self.is_static() {
            STATIC_INTERNAL_PORT
        } else {
            APP_INTERNAL_PORT
        }
    }

    /// Directory holding the compiled assets of a single-page app
    pub fn build_output_dir(&self) -> Option<&'static str> {
        match self {
            AppType::Vite => Some("dist"),
            AppType::React => Some("build"),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppType::Static => "static",
            AppType::Vite => "vite",
            AppType::React => "react",
            AppType::Express => "express",
            AppType::Node => "node",
            AppType::Nextjs => "nextjs",
            AppType::Nestjs => "nestjs",
        }
    }
}

impl std::fmt::Display for AppType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AppType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "static" | "html" => Ok(AppType::Static),
            "vite" => Ok(AppType::Vite),
            "react" | "cra" => Ok(AppType::React),
            "express" => Ok(AppType::Express),
            "node" | "nodejs" => Ok(AppType::Node),
            "nextjs" | "next" => Ok(AppType::Nextjs),
            "nestjs" | "nest" => Ok(AppType::Nestjs),
            _ => Err(format!("Unsupported application type: {}", s)),
        }
    }
}

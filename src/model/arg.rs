use clap::Parser;

/// Slack 代码助手机器人
#[derive(Parser, Debug)]
#[command(name = "slack-code-agent", version, about)]
pub struct Args {
    /// 启动前加载的 .env 文件路径（默认尝试当前目录下的 .env）
    #[arg(long)]
    pub env_file: Option<String>,

    /// 覆盖 WEBHOOK_HOST
    #[arg(long)]
    pub host: Option<String>,

    /// 覆盖 WEBHOOK_PORT
    #[arg(short, long)]
    pub port: Option<u16>,

    /// 只校验配置并输出报告，不启动服务
    #[arg(long)]
    pub check_config: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overrides() {
        let args = Args::parse_from([
            "slack-code-agent",
            "--env-file",
            "prod.env",
            "--port",
            "9000",
            "--check-config",
        ]);
        assert_eq!(args.env_file.as_deref(), Some("prod.env"));
        assert_eq!(args.port, Some(9000));
        assert!(args.check_config);
        assert!(args.host.is_none());
    }
}

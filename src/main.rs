use log::LevelFilter;
use revdial::{
    is_temporary, DialConfig, Listener, PrefaceListener, ReverseDialListener, Role, TcpAcceptor,
};
use std::io::Result;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::sleep;

const LEVELS: [LevelFilter; 6] = [
    LevelFilter::Off,
    LevelFilter::Error,
    LevelFilter::Warn,
    LevelFilter::Info,
    LevelFilter::Debug,
    LevelFilter::Trace,
];

#[derive(StructOpt, Debug)]
#[structopt(name = "revdial")]
struct Opt {
    #[structopt(long = "log-level", default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(StructOpt, Debug)]
enum Command {
    Controller(ControllerOpt),
    Appliance(ApplianceOpt),
}

#[derive(StructOpt, Debug)]
struct ControllerOpt {
    #[structopt(long = "listen-addr", default_value = "0.0.0.0:8888")]
    listen_addr: SocketAddr,

    #[structopt(long = "appliance-ip")]
    appliance_ip: IpAddr,

    #[structopt(long = "role", default_value = "eda")]
    role: Role,
}

#[derive(StructOpt, Debug)]
struct ApplianceOpt {
    #[structopt(long = "remote-addr")]
    remote_addr: SocketAddr,

    #[structopt(long = "local-addr")]
    local_addr: Option<SocketAddr>,

    #[structopt(long = "role", default_value = "eda")]
    role: Role,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::from_args();

    env_logger::Builder::new()
        .filter_level(LevelFilter::Trace)
        .parse_default_env()
        .init();
    log::set_max_level(opt.log_level);
    tokio::spawn(async {
        if let Err(e) = adjust_verbosity().await {
            log::warn!("log level signals unavailable: {}", e);
        }
    });

    match opt.cmd {
        Command::Controller(opt) => run_controller(opt).await,
        Command::Appliance(opt) => run_appliance(opt).await,
    }
}

/// SIGUSR1 lowers the log level one step, SIGUSR2 raises it.
async fn adjust_verbosity() -> Result<()> {
    let mut quieter = signal(SignalKind::user_defined1())?;
    let mut louder = signal(SignalKind::user_defined2())?;
    loop {
        let step = tokio::select! {
            _ = quieter.recv() => -1,
            _ = louder.recv() => 1,
        };
        let cur = log::max_level();
        let next = step_level(cur, step);
        // announce while the message still passes the filter
        if next < cur {
            log::info!("log level set to {}", next);
            log::set_max_level(next);
        } else {
            log::set_max_level(next);
            log::info!("log level set to {}", next);
        }
    }
}

fn step_level(cur: LevelFilter, step: isize) -> LevelFilter {
    let idx = LEVELS.iter().position(|l| *l == cur).unwrap_or(3) as isize;
    LEVELS[(idx + step).clamp(0, LEVELS.len() as isize - 1) as usize]
}

async fn run_controller(opt: ControllerOpt) -> Result<()> {
    let listener = PrefaceListener::new(TcpAcceptor::bind(opt.listen_addr).await?);
    listener.register(opt.appliance_ip);
    let listener = Arc::new(listener);
    log::info!("controller listening on {}", listener.local_addr()?);

    {
        let listener = listener.clone();
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(1)).await;
                match listener
                    .dial_role(opt.appliance_ip, opt.role, Duration::from_secs(5))
                    .await
                {
                    Ok(conn) => match greet(conn).await {
                        Ok(reply) => log::info!("appliance replied {:?}", reply),
                        Err(e) => log::warn!("greeting appliance: {}", e),
                    },
                    Err(e) => log::warn!("dial {} {}: {}", opt.appliance_ip, opt.role, e),
                }
            }
        });
    }

    serve(&*listener).await
}

async fn run_appliance(opt: ApplianceOpt) -> Result<()> {
    let mut config = DialConfig::new(opt.remote_addr, opt.role);
    config.local_addr = opt.local_addr;
    let listener = Arc::new(ReverseDialListener::new(config));

    let remote_addr = opt.remote_addr;
    tokio::spawn(async move {
        loop {
            sleep(Duration::from_secs(1)).await;
            let res = match TcpStream::connect(remote_addr).await {
                Ok(conn) => greet(conn).await,
                Err(e) => Err(e),
            };
            match res {
                Ok(reply) => log::info!("controller replied {:?}", reply),
                Err(e) => log::warn!("greeting controller: {}", e),
            }
        }
    });

    serve(&*listener).await
}

async fn serve<L: Listener>(listener: &L) -> Result<()> {
    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) if is_temporary(&e) => continue,
            Err(e) => return Err(e),
        };
        tokio::spawn(async move {
            if let Err(e) = reply(conn).await {
                log::debug!("serving {}: {}", peer, e);
            }
        });
    }
}

async fn greet<S: AsyncRead + AsyncWrite + Unpin>(conn: S) -> Result<String> {
    let mut conn = BufReader::new(conn);
    conn.get_mut().write_all(b"hello\n").await?;
    let mut line = String::new();
    conn.read_line(&mut line).await?;
    Ok(line.trim_end().to_string())
}

async fn reply<S: AsyncRead + AsyncWrite + Unpin>(conn: S) -> Result<()> {
    let mut conn = BufReader::new(conn);
    let mut line = String::new();
    while conn.read_line(&mut line).await? > 0 {
        log::info!("got {:?}", line.trim_end());
        conn.get_mut().write_all(b"goodbye\n").await?;
        line.clear();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_level() {
        assert_eq!(step_level(LevelFilter::Info, 1), LevelFilter::Debug);
        assert_eq!(step_level(LevelFilter::Info, -1), LevelFilter::Warn);
        assert_eq!(step_level(LevelFilter::Trace, 1), LevelFilter::Trace);
        assert_eq!(step_level(LevelFilter::Off, -1), LevelFilter::Off);
    }
}

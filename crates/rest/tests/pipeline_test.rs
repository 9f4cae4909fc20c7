//! Ende-zu-Ende-Tests der Request-Pipeline gegen einen lokalen Mock-Dienst
//!
//! Ein axum-Server auf Port 0 spielt die Gegenseite und liefert die
//! Ratelimit-Header, die der echte Dienst setzen wuerde.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use palaver_rest::flows::{
    add_ordering, data_responses, request_flow, request_flow_without_ratelimit, retry_request_flow,
};
use palaver_rest::{
    Methode, PipelineKonfig, RatelimitLedger, Request, RequestAnswer, Route,
};

/// Startet den Mock-Dienst und gibt die Basis-URL zurueck
async fn dienst_starten(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let adresse = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", adresse)
}

fn jetzt_epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

fn konfig(max_wartezeit: Duration) -> PipelineKonfig {
    let mut k = PipelineKonfig::neu("Bot test-token");
    k.max_wartezeit = max_wartezeit;
    k
}

// ---------------------------------------------------------------------------
// Einzelner Erfolg
// ---------------------------------------------------------------------------

#[tokio::test]
async fn einzelner_erfolg_mit_ratelimit_headern() {
    async fn handler() -> impl IntoResponse {
        let reset = jetzt_epoch_millis() + 1000;
        (
            [
                ("X-RateLimit-Remaining", "4".to_string()),
                ("X-RateLimit-Limit", "5".to_string()),
                ("X-RateLimit-Reset", reset.to_string()),
            ],
            Json(json!({"ok": true})),
        )
    }

    let basis = dienst_starten(Router::new().route("/v1/x", get(handler))).await;
    let ledger = RatelimitLedger::starten();
    let (zugang, mut antworten) =
        request_flow::<serde_json::Value, u32>(konfig(Duration::from_secs(5)), ledger).unwrap();

    let route = Route::ohne_parameter(Methode::Get, format!("{basis}/v1/x"));
    zugang.senden(Request::json(route, 42).bauen()).await.unwrap();
    zugang.schliessen();

    let antwort = antworten.recv().await.expect("Eine Antwort erwartet");
    match antwort {
        RequestAnswer::Response {
            data,
            ctx,
            til_reset,
            remaining_requests,
            uri_request_limit,
            ..
        } => {
            assert_eq!(ctx, 42);
            assert_eq!(data["ok"], true);
            assert_eq!(remaining_requests, 4);
            assert_eq!(uri_request_limit, 5);
            assert!(til_reset > Duration::from_millis(500));
            assert!(til_reset <= Duration::from_millis(1000));
        }
        andere => panic!("Response erwartet, erhalten: {andere:?}"),
    }

    // Genau eine Antwort pro Request
    assert!(antworten.recv().await.is_none());
}

// ---------------------------------------------------------------------------
// 429 mit Global-Flag
// ---------------------------------------------------------------------------

#[tokio::test]
async fn globales_429_sperrt_fremde_route() {
    async fn limitiert() -> impl IntoResponse {
        (
            StatusCode::TOO_MANY_REQUESTS,
            [
                ("Retry-After", "2000"),
                ("X-Ratelimit-Global", "true"),
            ],
            "",
        )
    }
    async fn offen() -> impl IntoResponse {
        Json(json!({}))
    }

    let basis = dienst_starten(
        Router::new()
            .route("/v1/x", get(limitiert))
            .route("/v1/andere", get(offen)),
    )
    .await;
    let ledger = RatelimitLedger::starten();
    let (zugang, mut antworten) =
        request_flow::<serde_json::Value, ()>(konfig(Duration::from_millis(500)), ledger).unwrap();

    // Erster Request laeuft in das globale Limit
    let route_a = Route::ohne_parameter(Methode::Get, format!("{basis}/v1/x"));
    zugang.senden(Request::json(route_a, ()).bauen()).await.unwrap();

    match antworten.recv().await.expect("Antwort erwartet") {
        RequestAnswer::Ratelimited {
            is_global,
            til_reset,
            ..
        } => {
            assert!(is_global);
            assert!(til_reset >= Duration::from_millis(1900));
            assert!(til_reset <= Duration::from_millis(2000));
        }
        andere => panic!("Ratelimited erwartet, erhalten: {andere:?}"),
    }

    // Unbeteiligte Raw-Route innerhalb des Fensters: am Tor verworfen
    let start = Instant::now();
    let route_b = Route::ohne_parameter(Methode::Get, format!("{basis}/v1/andere"));
    zugang.senden(Request::json(route_b, ()).bauen()).await.unwrap();
    zugang.schliessen();

    match antworten.recv().await.expect("Antwort erwartet") {
        RequestAnswer::Dropped { .. } => {}
        andere => panic!("Dropped erwartet, erhalten: {andere:?}"),
    }
    // Die maximale Wartezeit wurde abgewartet, nicht mehr
    let dauer = start.elapsed();
    assert!(dauer >= Duration::from_millis(450));
    assert!(dauer < Duration::from_millis(1900));
}

// ---------------------------------------------------------------------------
// Wiederholung bis zum Erfolg
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wiederholung_bis_zum_erfolg() {
    async fn wacklig(State(zaehler): State<Arc<AtomicU32>>) -> axum::response::Response {
        let n = zaehler.fetch_add(1, Ordering::SeqCst) + 1;
        if n < 3 {
            (StatusCode::INTERNAL_SERVER_ERROR, "kaputt").into_response()
        } else {
            Json(json!({"versuch": n})).into_response()
        }
    }

    let zaehler = Arc::new(AtomicU32::new(0));
    let basis = dienst_starten(
        Router::new()
            .route("/v1/wacklig", get(wacklig))
            .with_state(Arc::clone(&zaehler)),
    )
    .await;
    let ledger = RatelimitLedger::starten();
    let (zugang, mut antworten) =
        retry_request_flow::<serde_json::Value, u8>(konfig(Duration::from_secs(5)), ledger, 3)
            .unwrap();

    let route = Route::ohne_parameter(Methode::Get, format!("{basis}/v1/wacklig"));
    zugang.senden(Request::json(route, 7).bauen()).await.unwrap();
    zugang.schliessen();

    match antworten.recv().await.expect("Erfolg erwartet") {
        RequestAnswer::Response { data, ctx, .. } => {
            assert_eq!(ctx, 7);
            assert_eq!(data["versuch"], 3);
        }
        andere => panic!("Response erwartet, erhalten: {andere:?}"),
    }
    assert!(antworten.recv().await.is_none());
    // Genau drei HTTP-Versuche
    assert_eq!(zaehler.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn erschoepfte_wiederholungen_werden_verworfen() {
    async fn immer_kaputt(State(zaehler): State<Arc<AtomicU32>>) -> impl IntoResponse {
        zaehler.fetch_add(1, Ordering::SeqCst);
        (StatusCode::INTERNAL_SERVER_ERROR, "kaputt")
    }

    let zaehler = Arc::new(AtomicU32::new(0));
    let basis = dienst_starten(
        Router::new()
            .route("/v1/kaputt", get(immer_kaputt))
            .with_state(Arc::clone(&zaehler)),
    )
    .await;
    let ledger = RatelimitLedger::starten();
    let (zugang, mut antworten) =
        retry_request_flow::<serde_json::Value, ()>(konfig(Duration::from_secs(5)), ledger, 2)
            .unwrap();

    let route = Route::ohne_parameter(Methode::Get, format!("{basis}/v1/kaputt"));
    zugang.senden(Request::json(route, ()).bauen()).await.unwrap();
    zugang.schliessen();

    // Keine Antwort, stiller Verlust nach zwei Versuchen
    assert!(antworten.recv().await.is_none());
    assert_eq!(zaehler.load(Ordering::SeqCst), 2);
}

// ---------------------------------------------------------------------------
// Bucket-Teilung ueber die Raw-Route
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gleiche_raw_route_teilt_bucket() {
    async fn nachrichten(
        Path(user_id): Path<String>,
        State(treffer): State<Arc<parking_lot::Mutex<Vec<Instant>>>>,
    ) -> impl IntoResponse {
        treffer.lock().push(Instant::now());
        let reset = jetzt_epoch_millis() + 500;
        (
            [
                ("X-RateLimit-Remaining", "0".to_string()),
                ("X-RateLimit-Limit", "1".to_string()),
                ("X-RateLimit-Reset", reset.to_string()),
            ],
            Json(json!({ "user": user_id })),
        )
    }

    let treffer: Arc<parking_lot::Mutex<Vec<Instant>>> = Arc::default();
    let basis = dienst_starten(
        Router::new()
            .route("/v1/users/{user_id}/messages", get(nachrichten))
            .with_state(Arc::clone(&treffer)),
    )
    .await;
    let ledger = RatelimitLedger::starten();
    let (zugang, mut antworten) =
        request_flow::<serde_json::Value, u8>(konfig(Duration::from_secs(5)), ledger).unwrap();

    let template = "/v1/users/{user_id}/messages";

    // Erster Request: frischer Bucket, passiert sofort
    let route_a = Route::neu(
        Methode::Get,
        template,
        format!("{basis}/v1/users/111/messages"),
    );
    zugang.senden(Request::json(route_a, 1).bauen()).await.unwrap();
    let erste = antworten.recv().await.expect("Antwort erwartet");
    assert!(erste.ist_erfolg());

    // Zweiter Request, andere URI, selbe Raw-Route: wartet auf den Reset
    let route_b = Route::neu(
        Methode::Get,
        template,
        format!("{basis}/v1/users/222/messages"),
    );
    zugang.senden(Request::json(route_b, 2).bauen()).await.unwrap();
    zugang.schliessen();
    let zweite = antworten.recv().await.expect("Antwort erwartet");
    assert!(zweite.ist_erfolg());

    let zeiten = treffer.lock();
    assert_eq!(zeiten.len(), 2);
    assert!(
        zeiten[1] - zeiten[0] >= Duration::from_millis(400),
        "Zweiter Treffer kam nach {:?}",
        zeiten[1] - zeiten[0]
    );
}

// ---------------------------------------------------------------------------
// Status-Sonderfaelle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_204_durch_leeren_parser() {
    async fn kein_inhalt() -> impl IntoResponse {
        StatusCode::NO_CONTENT
    }

    let basis = dienst_starten(Router::new().route("/v1/leer", get(kein_inhalt))).await;
    let ledger = RatelimitLedger::starten();

    // Parser der leere Koerper akzeptiert -> Erfolg
    let (zugang, mut antworten) =
        request_flow::<(), ()>(konfig(Duration::from_secs(5)), ledger.clone()).unwrap();
    let route = Route::ohne_parameter(Methode::Get, format!("{basis}/v1/leer"));
    zugang
        .senden(Request::ohne_antwort(route.clone(), ()).bauen())
        .await
        .unwrap();
    zugang.schliessen();
    assert!(antworten.recv().await.unwrap().ist_erfolg());

    // JSON-Parser lehnt leeren Koerper ab -> Dekodierungsfehler
    let (zugang, mut antworten) =
        request_flow::<serde_json::Value, ()>(konfig(Duration::from_secs(5)), ledger).unwrap();
    zugang.senden(Request::json(route, ()).bauen()).await.unwrap();
    zugang.schliessen();
    match antworten.recv().await.unwrap() {
        RequestAnswer::Error { ursache, .. } => {
            assert!(matches!(
                ursache,
                palaver_core::PalaverError::Dekodierung(_)
            ));
        }
        andere => panic!("Error erwartet, erhalten: {andere:?}"),
    }
}

#[tokio::test]
async fn http_fehler_traegt_status_und_koerper() {
    async fn nicht_da() -> impl IntoResponse {
        (StatusCode::NOT_FOUND, "Unknown Channel")
    }

    let basis = dienst_starten(Router::new().route("/v1/fehlt", get(nicht_da))).await;
    let ledger = RatelimitLedger::starten();
    let (zugang, mut antworten) =
        request_flow::<serde_json::Value, ()>(konfig(Duration::from_secs(5)), ledger).unwrap();

    let route = Route::ohne_parameter(Methode::Get, format!("{basis}/v1/fehlt"));
    zugang.senden(Request::json(route, ()).bauen()).await.unwrap();
    zugang.schliessen();

    match antworten.recv().await.unwrap() {
        RequestAnswer::Error { ursache, .. } => match ursache {
            palaver_core::PalaverError::Http { status, koerper } => {
                assert_eq!(status, 404);
                assert_eq!(koerper, "Unknown Channel");
            }
            andere => panic!("Http-Fehler erwartet, erhalten: {andere:?}"),
        },
        andere => panic!("Error erwartet, erhalten: {andere:?}"),
    }
}

#[tokio::test]
async fn headerloses_429_setzt_bucket_nicht_fest() {
    async fn erst_limitiert(State(zaehler): State<Arc<AtomicU32>>) -> axum::response::Response {
        let n = zaehler.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 1 {
            // 429 ohne Retry-After/Reset/Remaining/Limit
            (StatusCode::TOO_MANY_REQUESTS, "").into_response()
        } else {
            Json(json!({"ok": true})).into_response()
        }
    }

    let zaehler = Arc::new(AtomicU32::new(0));
    let basis = dienst_starten(
        Router::new()
            .route("/v1/x", get(erst_limitiert))
            .with_state(Arc::clone(&zaehler)),
    )
    .await;
    let ledger = RatelimitLedger::starten();
    let (zugang, mut antworten) =
        request_flow::<serde_json::Value, u8>(konfig(Duration::from_millis(300)), ledger).unwrap();

    // Erster Request: 429 ohne jede Zeitangabe
    let route = Route::ohne_parameter(Methode::Get, format!("{basis}/v1/x"));
    zugang.senden(Request::json(route.clone(), 1).bauen()).await.unwrap();
    match antworten.recv().await.expect("Antwort erwartet") {
        RequestAnswer::Ratelimited {
            is_global,
            til_reset,
            ..
        } => {
            assert!(!is_global);
            assert_eq!(til_reset, Duration::ZERO);
        }
        andere => panic!("Ratelimited erwartet, erhalten: {andere:?}"),
    }

    // Ohne durchsetzbare Wartezeit darf der Bucket nicht festsitzen:
    // der naechste Request derselben Raw-Route passiert sofort
    let start = Instant::now();
    zugang.senden(Request::json(route, 2).bauen()).await.unwrap();
    zugang.schliessen();

    let zweite = antworten.recv().await.expect("Antwort erwartet");
    assert!(
        zweite.ist_erfolg(),
        "Erfolg erwartet, erhalten: {zweite:?}"
    );
    assert!(
        start.elapsed() < Duration::from_millis(250),
        "Request wartete {:?} statt sofort zu passieren",
        start.elapsed()
    );
    assert_eq!(zaehler.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn ohne_ratelimit_wird_nicht_gesperrt() {
    async fn limitiert() -> impl IntoResponse {
        (
            StatusCode::TOO_MANY_REQUESTS,
            [("Retry-After", "60000")],
            "",
        )
    }

    let basis = dienst_starten(Router::new().route("/v1/x", get(limitiert))).await;
    let (zugang, mut antworten) =
        request_flow_without_ratelimit::<serde_json::Value, u8>(konfig(Duration::from_millis(100)))
            .unwrap();

    // Beide Requests erreichen die Leitung, kein Tor haelt sie auf
    let route = Route::ohne_parameter(Methode::Get, format!("{basis}/v1/x"));
    zugang.senden(Request::json(route.clone(), 1).bauen()).await.unwrap();
    zugang.senden(Request::json(route, 2).bauen()).await.unwrap();
    zugang.schliessen();

    for _ in 0..2 {
        match antworten.recv().await.unwrap() {
            RequestAnswer::Ratelimited { .. } => {}
            andere => panic!("Ratelimited erwartet, erhalten: {andere:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Kontext-Treue und Header
// ---------------------------------------------------------------------------

#[tokio::test]
async fn kontext_bleibt_beim_eigenen_request() {
    async fn echo(Path(n): Path<u32>) -> impl IntoResponse {
        Json(json!({ "n": n }))
    }

    let basis = dienst_starten(Router::new().route("/v1/echo/{n}", get(echo))).await;
    let ledger = RatelimitLedger::starten();
    let (zugang, mut antworten) =
        request_flow::<serde_json::Value, u32>(konfig(Duration::from_secs(5)), ledger).unwrap();

    for n in 0..5u32 {
        let route = Route::neu(Methode::Get, "/v1/echo/{n}", format!("{basis}/v1/echo/{n}"));
        zugang.senden(Request::json(route, n).bauen()).await.unwrap();
    }
    zugang.schliessen();

    // Reihenfolge ist nicht garantiert, aber ctx und Nutzlast gehoeren
    // immer zusammen
    let mut gesehen = 0;
    while let Some(antwort) = antworten.recv().await {
        let (data, ctx) = antwort.in_erfolg().expect("Erfolg erwartet");
        assert_eq!(data["n"], ctx);
        gesehen += 1;
    }
    assert_eq!(gesehen, 5);
}

#[tokio::test]
async fn audit_log_begruendung_wird_uebertragen() {
    async fn echo_header(headers: HeaderMap) -> impl IntoResponse {
        let grund = headers
            .get("X-Audit-Log-Reason")
            .and_then(|w| w.to_str().ok())
            .unwrap_or("")
            .to_string();
        Json(json!({ "grund": grund }))
    }

    let basis = dienst_starten(Router::new().route("/v1/mod", get(echo_header))).await;
    let ledger = RatelimitLedger::starten();
    let (zugang, mut antworten) =
        request_flow::<serde_json::Value, ()>(konfig(Duration::from_secs(5)), ledger).unwrap();

    let route = Route::ohne_parameter(Methode::Get, format!("{basis}/v1/mod"));
    let anfrage = Request::json(route, ())
        .begruendung("Spam entfernt")
        .unwrap()
        .bauen();
    zugang.senden(anfrage).await.unwrap();
    zugang.schliessen();

    let (data, _) = antworten.recv().await.unwrap().in_erfolg().unwrap();
    assert_eq!(data["grund"], "Spam entfernt");
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

#[tokio::test]
async fn data_responses_filtert_fehlschlaege() {
    async fn ok() -> impl IntoResponse {
        Json(json!({"ok": true}))
    }
    async fn kaputt() -> impl IntoResponse {
        (StatusCode::NOT_FOUND, "weg")
    }

    let basis = dienst_starten(
        Router::new()
            .route("/v1/ok", get(ok))
            .route("/v1/kaputt", get(kaputt)),
    )
    .await;
    let ledger = RatelimitLedger::starten();
    let (zugang, antworten) =
        request_flow::<serde_json::Value, u8>(konfig(Duration::from_secs(5)), ledger).unwrap();
    let mut daten = data_responses(antworten);

    let route_ok = Route::ohne_parameter(Methode::Get, format!("{basis}/v1/ok"));
    let route_kaputt = Route::ohne_parameter(Methode::Get, format!("{basis}/v1/kaputt"));
    zugang.senden(Request::json(route_kaputt, 1).bauen()).await.unwrap();
    zugang.senden(Request::json(route_ok, 2).bauen()).await.unwrap();
    zugang.schliessen();

    let (data, ctx) = daten.recv().await.expect("Ein Erfolg erwartet");
    assert_eq!(ctx, 2);
    assert_eq!(data["ok"], true);
    assert!(daten.recv().await.is_none());
}

#[tokio::test]
async fn add_ordering_stellt_reihenfolge_wieder_her() {
    async fn langsam() -> impl IntoResponse {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Json(json!({"tempo": "langsam"}))
    }
    async fn schnell() -> impl IntoResponse {
        Json(json!({"tempo": "schnell"}))
    }

    let basis = dienst_starten(
        Router::new()
            .route("/v1/langsam", get(langsam))
            .route("/v1/schnell", get(schnell)),
    )
    .await;

    let (zugang, mut antworten) = add_ordering::<serde_json::Value, &'static str>(
        konfig(Duration::from_secs(5)),
        Some(RatelimitLedger::starten()),
    )
    .unwrap();

    let route_l = Route::ohne_parameter(Methode::Get, format!("{basis}/v1/langsam"));
    let route_s = Route::ohne_parameter(Methode::Get, format!("{basis}/v1/schnell"));
    zugang.senden(Request::json(route_l, "erster").bauen()).await.unwrap();
    zugang.senden(Request::json(route_s, "zweiter").bauen()).await.unwrap();
    zugang.schliessen();

    // Trotz langsamer erster Antwort bleibt die Eingabe-Reihenfolge
    let (_, ctx) = antworten.recv().await.unwrap().in_erfolg().unwrap();
    assert_eq!(ctx, "erster");
    let (_, ctx) = antworten.recv().await.unwrap().in_erfolg().unwrap();
    assert_eq!(ctx, "zweiter");
    assert!(antworten.recv().await.is_none());
}
